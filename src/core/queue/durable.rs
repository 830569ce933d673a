use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{EnqueueOutcome, JobListFilter, JobMutation, JobPlacer, QueueBackend};
use crate::core::errors::{OrchestratorError, Result};
use crate::core::job::{Job, JobStatus};

const CLAIM_PAGE: usize = 64;
const MAX_CAS_ATTEMPTS: usize = 8;

/// A persisted job plus the optimistic-concurrency version it was read at.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub job: Job,
    pub version: i64,
    pub settled: bool,
    /// Insertion order; ties within a priority are broken by it.
    pub seq: i64,
}

/// Position in claim order: rows strictly after `(priority, seq)` come next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimCursor {
    pub priority: u8,
    pub seq: i64,
}

impl ClaimCursor {
    fn of(row: &JobRow) -> Self {
        Self {
            priority: row.job.priority.as_wire(),
            seq: row.seq,
        }
    }
}

/// Transactional storage port for [`DurableQueue`].
///
/// `update_row` is a compare-and-swap on `version`; it returns `false` when
/// another writer got there first.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Returns `false` when a row with the same id already exists.
    async fn insert_row(&self, job: &Job) -> Result<bool>;

    async fn fetch_row(&self, job_id: &str) -> Result<Option<JobRow>>;

    /// Queued rows whose backoff has elapsed, highest priority first then oldest,
    /// starting after `after` when given.
    async fn claimable_rows(
        &self,
        now: DateTime<Utc>,
        after: Option<ClaimCursor>,
        limit: usize,
    ) -> Result<Vec<JobRow>>;

    async fn update_row(&self, job: &Job, expected_version: i64, settled: bool) -> Result<bool>;

    async fn count_status(&self, status: JobStatus) -> Result<usize>;

    /// Newest first.
    async fn list_rows(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobRow>>;

    /// Deletes settled rows except the `keep` most recently settled.
    async fn delete_settled_beyond(&self, keep: usize) -> Result<usize>;
}

/// Queue backed by a [`QueueStore`]; survives restarts.
pub struct DurableQueue<S: QueueStore> {
    store: S,
    max_pending: usize,
}

impl<S: QueueStore> DurableQueue<S> {
    pub fn new(store: S, max_pending: usize) -> Self {
        Self { store, max_pending }
    }

    /// Startup pass: claims held by a previous process have no live robot
    /// behind them, so they go back to the queue. Running jobs stay put and
    /// are resolved by the timeout sweep.
    pub async fn recover(&self) -> Result<usize> {
        let claimed = self.store.list_rows(Some(JobStatus::Claimed), usize::MAX).await?;
        let mut recovered = 0;
        for row in claimed {
            let mut job = row.job;
            job.release_claim(None)?;
            if self.store.update_row(&job, row.version, false).await? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Returned orphaned claims to the queue");
        }
        Ok(recovered)
    }

    async fn modify(
        &self,
        job_id: &str,
        mutate: &mut (dyn FnMut(&mut Job) -> Result<()> + Send),
        settle: bool,
    ) -> Result<Job> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let row = self
                .store
                .fetch_row(job_id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))?;
            let mut job = row.job;
            mutate(&mut job)?;
            if job.job_id != job_id {
                return Err(OrchestratorError::Validation(
                    "a job's id cannot change".to_string(),
                ));
            }
            if self
                .store
                .update_row(&job, row.version, row.settled || settle)
                .await?
            {
                return Ok(job);
            }
        }
        warn!(job_id = %job_id, "Job update lost every compare-and-swap attempt");
        Err(OrchestratorError::QueueBackend(format!(
            "concurrent modification of job {}",
            job_id
        )))
    }
}

#[async_trait]
impl<S: QueueStore> QueueBackend for DurableQueue<S> {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn enqueue(&self, mut job: Job) -> Result<EnqueueOutcome> {
        if self.store.count_status(JobStatus::Queued).await? >= self.max_pending {
            return Ok(EnqueueOutcome::rejected("queue is full"));
        }
        if job.status == JobStatus::Pending {
            job.mark_queued(Utc::now())?;
        } else if job.status != JobStatus::Queued {
            return Ok(EnqueueOutcome::rejected(format!(
                "job {} is {}, only pending jobs can be queued",
                job.job_id, job.status
            )));
        }
        if !self.store.insert_row(&job).await? {
            return Ok(EnqueueOutcome::rejected(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        Ok(EnqueueOutcome::accepted())
    }

    async fn dequeue_next(
        &self,
        now: DateTime<Utc>,
        placer: &dyn JobPlacer,
    ) -> Result<Option<Job>> {
        // Keyset paging: rows claimed by others between pages cannot shift the window.
        let mut after = None;
        loop {
            let rows = self.store.claimable_rows(now, after, CLAIM_PAGE).await?;
            let page_len = rows.len();
            let Some(last) = rows.last() else {
                return Ok(None);
            };
            after = Some(ClaimCursor::of(last));
            for row in rows {
                if !row.job.is_eligible_at(now) {
                    continue;
                }
                let Some(robot_id) = placer.choose(&row.job) else {
                    continue;
                };
                let mut job = row.job;
                job.claim(&robot_id, now)?;
                // Losing the swap means another dispatcher claimed it first.
                if self.store.update_row(&job, row.version, false).await? {
                    return Ok(Some(job));
                }
            }
            if page_len < CLAIM_PAGE {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        let mut settle = |job: &mut Job| {
            if !job.status.is_terminal() {
                return Err(OrchestratorError::Validation(format!(
                    "job {} is {} and cannot be settled",
                    job.job_id, job.status
                )));
            }
            job.workflow_payload.clear();
            Ok(())
        };
        self.modify(job_id, &mut settle, true).await.map(|_| ())
    }

    async fn requeue(&self, job_id: &str, not_before: Option<DateTime<Utc>>) -> Result<Job> {
        let mut release = |job: &mut Job| job.release_claim(not_before);
        self.modify(job_id, &mut release, false).await
    }

    async fn update(&self, job_id: &str, mutate: JobMutation<'_>) -> Result<Job> {
        self.modify(job_id, mutate, false).await
    }

    async fn pending_count(&self) -> Result<usize> {
        self.store.count_status(JobStatus::Queued).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.store.fetch_row(job_id).await?.map(|r| r.job))
    }

    async fn list(&self, filter: &JobListFilter) -> Result<Vec<Job>> {
        let rows = self
            .store
            .list_rows(filter.status, filter.limit.unwrap_or(usize::MAX))
            .await?;
        Ok(rows.into_iter().map(|r| r.job).collect())
    }

    async fn prune_history(&self, keep: usize) -> Result<usize> {
        self.store.delete_settled_beyond(keep).await
    }
}
