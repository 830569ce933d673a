use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::Storage;
use crate::core::errors::Result;
use crate::core::triggers::TriggerConfig;

type TriggerRow = (String, i64, i64, Option<String>);

fn merge((json, trigger_count, success_count, last): TriggerRow) -> Result<TriggerConfig> {
    let mut config: TriggerConfig = serde_json::from_str(&json)?;
    config.trigger_count = trigger_count.max(0) as u64;
    config.success_count = success_count.max(0) as u64;
    config.last_triggered = last
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc));
    Ok(config)
}

impl Storage {
    /// Upserts the configuration; counters are kept from the existing row.
    pub async fn save_trigger(&self, config: &TriggerConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO triggers (trigger_id, config_json) VALUES (?1, ?2)
             ON CONFLICT(trigger_id) DO UPDATE SET
                config_json = excluded.config_json,
                updated_at = CURRENT_TIMESTAMP",
            params![config.id, json],
        )?;
        Ok(())
    }

    pub async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerConfig>> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT config_json, trigger_count, success_count, last_triggered
                 FROM triggers WHERE trigger_id = ?1",
                params![trigger_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(merge).transpose()
    }

    pub async fn list_triggers(&self) -> Result<Vec<TriggerConfig>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT config_json, trigger_count, success_count, last_triggered
             FROM triggers ORDER BY created_at, trigger_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(merge(row?)?);
        }
        Ok(results)
    }

    pub async fn delete_trigger(&self, trigger_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            "DELETE FROM triggers WHERE trigger_id = ?1",
            params![trigger_id],
        )?;
        Ok(deleted > 0)
    }

    pub async fn record_trigger_fire(
        &self,
        trigger_id: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE triggers SET
                trigger_count = trigger_count + 1,
                success_count = success_count + ?2,
                last_triggered = ?3
             WHERE trigger_id = ?1",
            params![trigger_id, success as i64, at.to_rfc3339()],
        )?;
        Ok(())
    }
}
