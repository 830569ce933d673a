//! Job queue backends.
//!
//! The queue is also the job registry: it owns every job record from submission
//! to the end of its history window. All state changes go through
//! [`QueueBackend::update`], which applies a mutation atomically, so dispatch
//! cycles and inbound robot handlers never overwrite each other.
//!
//! Two interchangeable backends:
//! - [`memory::MemoryQueue`]: single lock, lost on restart
//! - [`durable::DurableQueue`]: adapter over a transactional [`durable::QueueStore`]

pub mod durable;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::core::config::{QueueBackendKind, QueueConfig};
use crate::core::errors::Result;
use crate::core::job::{Job, JobStatus};
use crate::core::storage::Storage;

/// Decides which robot a queued job should go to, or `None` to leave it queued.
pub trait JobPlacer: Send + Sync {
    fn choose(&self, job: &Job) -> Option<String>;
}

impl<F> JobPlacer for F
where
    F: Fn(&Job) -> Option<String> + Send + Sync,
{
    fn choose(&self, job: &Job) -> Option<String> {
        self(job)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl EnqueueOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

pub type JobMutation<'a> = &'a mut (dyn FnMut(&mut Job) -> Result<()> + Send);

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accepts a `Pending` (or already `Queued`) job and makes it claimable.
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome>;

    /// Claims the highest-priority eligible job the placer accepts, oldest first
    /// within a priority. The returned job is `Claimed` and invisible to other callers.
    async fn dequeue_next(
        &self,
        now: DateTime<Utc>,
        placer: &dyn JobPlacer,
    ) -> Result<Option<Job>>;

    /// Settles a terminal job into history and drops its workflow payload.
    async fn ack(&self, job_id: &str) -> Result<()>;

    /// Returns a claimed job to the queue without consuming a retry.
    async fn requeue(&self, job_id: &str, not_before: Option<DateTime<Utc>>) -> Result<Job>;

    /// Atomic read-modify-write of one job. A mutation error leaves the job untouched.
    async fn update(&self, job_id: &str, mutate: JobMutation<'_>) -> Result<Job>;

    async fn pending_count(&self) -> Result<usize>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// Most recently created first.
    async fn list(&self, filter: &JobListFilter) -> Result<Vec<Job>>;

    /// Deletes the oldest settled jobs beyond `keep`; returns how many were removed.
    async fn prune_history(&self, keep: usize) -> Result<usize>;
}

/// Selects the backend from configuration. Nothing else in the crate knows which one runs.
pub async fn build_backend(
    config: &QueueConfig,
    storage: Option<Storage>,
) -> Result<Arc<dyn QueueBackend>> {
    match config.backend {
        QueueBackendKind::Memory => Ok(Arc::new(memory::MemoryQueue::new(config.max_pending))),
        QueueBackendKind::Sqlite => {
            let storage = match storage {
                Some(s) => s,
                None => Storage::open(&config.sqlite_path).await?,
            };
            let queue = durable::DurableQueue::new(storage, config.max_pending);
            queue.recover().await?;
            Ok(Arc::new(queue))
        }
    }
}

#[cfg(test)]
mod tests;
