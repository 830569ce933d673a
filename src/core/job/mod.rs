pub mod types;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub use types::{JobPriority, JobStatus};

use crate::core::errors::{OrchestratorError, Result};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;
/// Longest accepted job timeout (30 days).
pub const MAX_TIMEOUT_SECONDS: u64 = 30 * 24 * 3600;

/// Rejects zero and anything above [`MAX_TIMEOUT_SECONDS`].
pub fn check_timeout(secs: u64) -> Result<u64> {
    if secs == 0 || secs > MAX_TIMEOUT_SECONDS {
        return Err(OrchestratorError::Validation(format!(
            "timeout_seconds must be between 1 and {}, got {}",
            MAX_TIMEOUT_SECONDS, secs
        )));
    }
    Ok(secs)
}

/// Legal edges of the job lifecycle graph.
///
/// `Running -> Queued` is the retry edge and is additionally guarded by
/// `retry_count < max_retries` in [`Job::retry`]. `Claimed -> Queued` releases a
/// claim that never started (robot rejected or vanished) and does not consume a retry.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    match from {
        JobStatus::Pending => matches!(to, JobStatus::Queued | JobStatus::Cancelled),
        JobStatus::Queued => matches!(to, JobStatus::Claimed | JobStatus::Cancelled),
        JobStatus::Claimed => matches!(
            to,
            JobStatus::Running | JobStatus::Queued | JobStatus::Cancelled
        ),
        JobStatus::Running => matches!(
            to,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Queued
        ),
        JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub job_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    /// Opaque serialized workflow, handed to the robot untouched.
    pub workflow_payload: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub assigned_robot_id: Option<String>,
    /// Last robot that held the job; survives terminal states for history.
    #[serde(default)]
    pub executed_by: Option<String>,
    #[serde(default)]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time the job may be claimed again (retry backoff).
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub result: Option<Map<String, Value>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

impl Job {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        workflow_payload: impl Into<String>,
        priority: JobPriority,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            workflow_id,
            workflow_name,
            workflow_payload,
            priority,
        )
    }

    pub fn with_id(
        job_id: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        workflow_payload: impl Into<String>,
        priority: JobPriority,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            workflow_payload: workflow_payload.into(),
            priority,
            status: JobStatus::Pending,
            assigned_robot_id: None,
            executed_by: None,
            required_tags: Vec::new(),
            environment: None,
            input: Map::new(),
            metadata: Map::new(),
            created_at: Utc::now(),
            queued_at: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry_count: 0,
            max_retries: 0,
            not_before: None,
            progress: 0,
            current_node: None,
            result: None,
            error_message: None,
            error_type: None,
        }
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.required_tags = tags;
        self
    }

    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.not_before.is_none_or(|t| t <= now)
    }

    /// Deadline after which a running job is considered timed out.
    /// `None` when the job has not started or the timeout is not representable.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        let secs = i64::try_from(self.timeout_seconds).ok()?;
        chrono::Duration::try_seconds(secs).and_then(|d| started.checked_add_signed(d))
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !can_transition(self.status, to) {
            return Err(OrchestratorError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Queued)?;
        self.queued_at = Some(now);
        Ok(())
    }

    pub fn claim(&mut self, robot_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Claimed)?;
        self.assigned_robot_id = Some(robot_id.to_string());
        self.executed_by = Some(robot_id.to_string());
        self.claimed_at = Some(now);
        self.not_before = None;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Give a claim back to the queue without consuming a retry.
    pub fn release_claim(&mut self, not_before: Option<DateTime<Utc>>) -> Result<()> {
        if self.status != JobStatus::Claimed {
            return Err(OrchestratorError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.transition(JobStatus::Queued)?;
        self.assigned_robot_id = None;
        self.claimed_at = None;
        self.not_before = not_before;
        Ok(())
    }

    /// `Running -> Queued` on timeout or robot loss, only while retries remain.
    pub fn retry(
        &mut self,
        reason: &str,
        error_type: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != JobStatus::Running || self.retry_count >= self.max_retries {
            return Err(OrchestratorError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.transition(JobStatus::Queued)?;
        self.retry_count += 1;
        self.assigned_robot_id = None;
        self.claimed_at = None;
        self.started_at = None;
        self.progress = 0;
        self.current_node = None;
        self.not_before = Some(not_before);
        self.error_message = Some(reason.to_string());
        self.error_type = Some(error_type.to_string());
        Ok(())
    }

    pub fn complete(
        &mut self,
        result: Map<String, Value>,
        duration_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status == JobStatus::Claimed {
            self.start(now)?;
        }
        self.transition(JobStatus::Completed)?;
        self.finish(now, duration_ms);
        self.progress = 100;
        self.result = Some(result);
        self.error_message = None;
        self.error_type = None;
        Ok(())
    }

    pub fn fail(&mut self, error_type: &str, message: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status == JobStatus::Claimed {
            self.start(now)?;
        }
        self.transition(JobStatus::Failed)?;
        self.finish(now, None);
        self.error_type = Some(error_type.to_string());
        self.error_message = Some(message.to_string());
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Cancelled)?;
        self.finish(now, None);
        self.error_type = Some("Cancelled".to_string());
        self.error_message = Some(reason.to_string());
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>, duration_ms: Option<u64>) {
        self.assigned_robot_id = None;
        self.not_before = None;
        self.completed_at = Some(now);
        self.duration_ms = duration_ms.or_else(|| {
            self.started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64)
        });
    }
}
