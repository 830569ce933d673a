use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::Storage;
use crate::core::errors::Result;
use crate::core::job::{Job, JobStatus};
use crate::core::queue::durable::{ClaimCursor, JobRow, QueueStore};

const ROW_COLUMNS: &str = "body, version, settled_order, seq";

fn millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

type RawRow = (String, i64, Option<i64>, i64);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode((body, version, settled, seq): RawRow) -> Result<JobRow> {
    Ok(JobRow {
        job: serde_json::from_str(&body)?,
        version,
        settled: settled.is_some(),
        seq,
    })
}

#[async_trait]
impl QueueStore for Storage {
    async fn insert_row(&self, job: &Job) -> Result<bool> {
        let body = serde_json::to_string(job)?;
        let db = self.db.lock().await;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO jobs (job_id, status, priority, not_before, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.job_id,
                job.status.as_str(),
                job.priority.as_wire(),
                millis(job.not_before),
                body
            ],
        )?;
        Ok(inserted == 1)
    }

    async fn fetch_row(&self, job_id: &str) -> Result<Option<JobRow>> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                &format!("SELECT {} FROM jobs WHERE job_id = ?1", ROW_COLUMNS),
                params![job_id],
                read_row,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    async fn claimable_rows(
        &self,
        now: DateTime<Utc>,
        after: Option<ClaimCursor>,
        limit: usize,
    ) -> Result<Vec<JobRow>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs
             WHERE status = ?1 AND (not_before IS NULL OR not_before <= ?2)
               AND (?3 IS NULL OR priority < ?3 OR (priority = ?3 AND seq > ?4))
             ORDER BY priority DESC, seq ASC
             LIMIT ?5",
            ROW_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                JobStatus::Queued.as_str(),
                now.timestamp_millis(),
                after.map(|c| c.priority),
                after.map(|c| c.seq),
                sql_limit(limit)
            ],
            read_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(decode(row?)?);
        }
        Ok(results)
    }

    async fn update_row(&self, job: &Job, expected_version: i64, settled: bool) -> Result<bool> {
        let body = serde_json::to_string(job)?;
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE jobs SET
                status = ?1,
                priority = ?2,
                not_before = ?3,
                body = ?4,
                version = version + 1,
                settled_order = CASE
                    WHEN ?5 = 0 THEN NULL
                    ELSE COALESCE(settled_order,
                        (SELECT COALESCE(MAX(settled_order), 0) + 1 FROM jobs))
                END,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?6 AND version = ?7",
            params![
                job.status.as_str(),
                job.priority.as_wire(),
                millis(job.not_before),
                body,
                settled as i32,
                job.job_id,
                expected_version
            ],
        )?;
        Ok(updated == 1)
    }

    async fn count_status(&self, status: JobStatus) -> Result<usize> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    async fn list_rows(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobRow>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY seq DESC
             LIMIT ?2",
            ROW_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), sql_limit(limit)],
            read_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(decode(row?)?);
        }
        Ok(results)
    }

    async fn delete_settled_beyond(&self, keep: usize) -> Result<usize> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            "DELETE FROM jobs
             WHERE settled_order IS NOT NULL
               AND settled_order NOT IN (
                   SELECT settled_order FROM jobs
                   WHERE settled_order IS NOT NULL
                   ORDER BY settled_order DESC
                   LIMIT ?1
               )",
            params![sql_limit(keep)],
        )?;
        Ok(deleted)
    }
}
