mod jobs;
mod triggers;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::errors::{OrchestratorError, Result};
use crate::platform::{NativePlatform, Platform};

/// SQLite store shared by the durable queue and the trigger runner.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Mutex<Connection>>,
}

impl Storage {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                OrchestratorError::Configuration(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
            NativePlatform::restrict_dir_permissions(parent);
        }
        let db = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        init_schema(&db)?;
        info!(path = %path.display(), "Opened orchestrator store");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL,
            not_before INTEGER,
            version INTEGER NOT NULL DEFAULT 0,
            settled_order INTEGER,
            body TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status_priority_seq ON jobs(status, priority DESC, seq)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_settled_order ON jobs(settled_order)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS triggers (
            trigger_id TEXT PRIMARY KEY,
            config_json TEXT NOT NULL,
            trigger_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            last_triggered TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests;
