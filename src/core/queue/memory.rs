use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

use super::{EnqueueOutcome, JobListFilter, JobMutation, JobPlacer, QueueBackend};
use crate::core::errors::{OrchestratorError, Result};
use crate::core::job::{Job, JobPriority, JobStatus};

type PendingKey = (Reverse<JobPriority>, u64);

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// Insertion sequence per job; stable across requeues so a returned job
    /// keeps its place among equal priorities.
    seqs: HashMap<String, u64>,
    pending: BTreeMap<PendingKey, String>,
    settled: VecDeque<String>,
    settled_ids: HashSet<String>,
    next_seq: u64,
}

impl QueueState {
    /// Keeps the pending index in step with a status or priority change.
    fn store(&mut self, before: (JobStatus, JobPriority), job: Job) {
        if let Some(seq) = self.seqs.get(&job.job_id).copied() {
            if before.0 == JobStatus::Queued {
                self.pending.remove(&(Reverse(before.1), seq));
            }
            if job.status == JobStatus::Queued {
                self.pending
                    .insert((Reverse(job.priority), seq), job.job_id.clone());
            }
        }
        self.jobs.insert(job.job_id.clone(), job);
    }
}

/// In-process queue: one lock around the job map and a priority index.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    max_pending: usize,
}

impl MemoryQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_pending,
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

fn not_found(job_id: &str) -> OrchestratorError {
    OrchestratorError::NotFound(format!("job {}", job_id))
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, mut job: Job) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.job_id) {
            return Ok(EnqueueOutcome::rejected(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        if state.pending.len() >= self.max_pending {
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

        let seq = state.next_seq;
        state.next_seq += 1;
        state.seqs.insert(job.job_id.clone(), seq);
        state
            .pending
            .insert((Reverse(job.priority), seq), job.job_id.clone());
        state.jobs.insert(job.job_id.clone(), job);
        Ok(EnqueueOutcome::accepted())
    }

    async fn dequeue_next(
        &self,
        now: DateTime<Utc>,
        placer: &dyn JobPlacer,
    ) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let mut picked = None;
        for (key, job_id) in state.pending.iter() {
            let Some(job) = state.jobs.get(job_id) else {
                continue;
            };
            if !job.is_eligible_at(now) {
                continue;
            }
            if let Some(robot_id) = placer.choose(job) {
                picked = Some((*key, job_id.clone(), robot_id));
                break;
            }
        }

        let Some((key, job_id, robot_id)) = picked else {
            return Ok(None);
        };
        state.pending.remove(&key);
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| not_found(&job_id))?;
        job.claim(&robot_id, now)?;
        Ok(Some(job.clone()))
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if !job.status.is_terminal() {
            return Err(OrchestratorError::Validation(format!(
                "job {} is {} and cannot be settled",
                job_id, job.status
            )));
        }
        job.workflow_payload.clear();
        if state.settled_ids.insert(job_id.to_string()) {
            state.settled.push_back(job_id.to_string());
        }
        Ok(())
    }

    async fn requeue(&self, job_id: &str, not_before: Option<DateTime<Utc>>) -> Result<Job> {
        let mut state = self.state.lock().await;
        let mut job = state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| not_found(job_id))?;
        let before = (job.status, job.priority);
        job.release_claim(not_before)?;
        state.store(before, job.clone());
        Ok(job)
    }

    async fn update(&self, job_id: &str, mutate: JobMutation<'_>) -> Result<Job> {
        let mut state = self.state.lock().await;
        let mut job = state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| not_found(job_id))?;
        let before = (job.status, job.priority);
        mutate(&mut job)?;
        if job.job_id != job_id {
            return Err(OrchestratorError::Validation(
                "a job's id cannot change".to_string(),
            ));
        }
        state.store(before, job.clone());
        Ok(job)
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.state.lock().await.pending.len())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn list(&self, filter: &JobListFilter) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<(u64, Job)> = state
            .jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .map(|j| (state.seqs.get(&j.job_id).copied().unwrap_or(0), j.clone()))
            .collect();
        jobs.sort_by(|a, b| b.0.cmp(&a.0));
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(jobs.into_iter().take(limit).map(|(_, j)| j).collect())
    }

    async fn prune_history(&self, keep: usize) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        while state.settled.len() > keep {
            let Some(job_id) = state.settled.pop_front() else {
                break;
            };
            state.jobs.remove(&job_id);
            state.seqs.remove(&job_id);
            state.settled_ids.remove(&job_id);
            removed += 1;
        }
        Ok(removed)
    }
}
