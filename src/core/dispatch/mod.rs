//! Dispatch engine: matches queued jobs to robots and drives the job state
//! machine from robot replies, timeouts and robot loss.
//!
//! Every job mutation goes through [`QueueBackend::update`] (or `requeue`/`ack`),
//! and nothing here holds a queue or registry lock across a network send.

pub mod hub;
pub mod inbound;
pub mod placement;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::bus::{self, BusEvent, EventBus};
use crate::core::config::OrchestratorConfig;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::job::{Job, JobStatus};
use crate::core::protocol::payloads::{JobCompletePayload, JobFailedPayload, JobProgressPayload};
use crate::core::protocol::{AssignOptions, MessageBuilder};
use crate::core::queue::{JobListFilter, QueueBackend};
use crate::core::robot::{RobotDescriptor, RobotRegistry, SweepOutcome};

pub use hub::ConnectionHub;
pub use inbound::RobotSession;
pub use placement::Placement;

pub const TIMEOUT_ERROR: &str = "TimeoutError";
pub const ROBOT_TIMEOUT_ERROR: &str = "RobotTimeoutError";

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub reject_cooldown: Duration,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub heartbeat_timeout: Duration,
    pub removal_after: Duration,
    pub history_limit: usize,
}

impl DispatchSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            batch_size: config.dispatch.batch_size.max(1),
            reject_cooldown: Duration::seconds(config.dispatch.reject_cooldown_secs as i64),
            backoff_base_ms: config.dispatch.retry_backoff_base_ms,
            backoff_max_ms: config.dispatch.retry_backoff_max_ms,
            heartbeat_timeout: Duration::seconds(config.robots.heartbeat_timeout_secs as i64),
            removal_after: Duration::seconds(config.robots.removal_after_secs as i64),
            history_limit: config.queue.history_limit,
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::milliseconds(ms.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub assigned: usize,
    pub returned: usize,
}

/// Jobs a robot turned down, and until when it stays out of the running for them.
type Blacklist = HashMap<String, HashMap<String, DateTime<Utc>>>;

pub struct DispatchEngine {
    queue: Arc<dyn QueueBackend>,
    robots: Arc<RobotRegistry>,
    hub: Arc<ConnectionHub>,
    bus: Arc<EventBus>,
    placement: Placement,
    settings: DispatchSettings,
    rejections: Mutex<Blacklist>,
}

fn owned_by(job: &Job, robot_id: &str) -> Result<()> {
    if job.assigned_robot_id.as_deref() == Some(robot_id) {
        Ok(())
    } else {
        Err(OrchestratorError::Validation(format!(
            "job {} is not assigned to robot {}",
            job.job_id, robot_id
        )))
    }
}

impl DispatchEngine {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        robots: Arc<RobotRegistry>,
        hub: Arc<ConnectionHub>,
        bus: Arc<EventBus>,
        placement: Placement,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queue,
            robots,
            hub,
            bus,
            placement,
            settings,
            rejections: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    pub fn robots(&self) -> &Arc<RobotRegistry> {
        &self.robots
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    fn rejections(&self) -> std::sync::MutexGuard<'_, Blacklist> {
        self.rejections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Active rejections, pruning the expired ones.
    fn rejection_snapshot(&self, now: DateTime<Utc>) -> HashMap<String, HashSet<String>> {
        let mut rejections = self.rejections();
        rejections.retain(|_, robots| {
            robots.retain(|_, until| *until > now);
            !robots.is_empty()
        });
        rejections
            .iter()
            .map(|(job, robots)| (job.clone(), robots.keys().cloned().collect()))
            .collect()
    }

    fn clear_rejections(&self, job_id: &str) {
        self.rejections().remove(job_id);
    }

    fn publish_job(&self, event_type: &str, job: &Job) {
        let mut data = Map::new();
        data.insert("job_id".to_string(), json!(job.job_id));
        data.insert("workflow_id".to_string(), json!(job.workflow_id));
        data.insert("status".to_string(), json!(job.status.as_str()));
        data.insert("robot_id".to_string(), json!(job.executed_by));
        if let Some(error_type) = &job.error_type {
            data.insert("error_type".to_string(), json!(error_type));
        }
        if let Some(trigger_id) = job.metadata.get("trigger_id") {
            data.insert("trigger_id".to_string(), trigger_id.clone());
        }
        let mut event = BusEvent::new(event_type, data);
        if let Some(robot_id) = &job.executed_by {
            event = event.with_node(robot_id.clone());
        }
        self.bus.publish(event);
    }

    fn publish_robot(&self, event_type: &str, robot_id: &str) {
        let mut data = Map::new();
        data.insert("robot_id".to_string(), json!(robot_id));
        self.bus
            .publish(BusEvent::new(event_type, data).with_node(robot_id));
    }

    // --- dispatch cycle ---

    /// One matching pass: claims up to `batch_size` jobs and sends `JOB_ASSIGN`
    /// for each. Jobs with no eligible robot stay queued for the next cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut fleet = self.robots.eligible().await;
        if fleet.is_empty() {
            return Ok(report);
        }
        let rejected = self.rejection_snapshot(now);

        for _ in 0..self.settings.batch_size {
            let placer = |job: &Job| -> Option<String> {
                let turned_down = rejected.get(&job.job_id);
                let candidates: Vec<&RobotDescriptor> = fleet
                    .iter()
                    .filter(|r| r.accepts_work())
                    .filter(|r| r.matches(&job.required_tags, job.environment.as_deref()))
                    .filter(|r| !turned_down.is_some_and(|set| set.contains(&r.robot_id)))
                    .collect();
                self.placement.select(&candidates).map(|r| r.robot_id.clone())
            };
            let Some(job) = self.queue.dequeue_next(now, &placer).await? else {
                break;
            };
            let Some(robot_id) = job.assigned_robot_id.clone() else {
                continue;
            };

            if !self.robots.assign(&robot_id, &job.job_id).await {
                // Robot left or filled up between the snapshot and the claim.
                self.queue.requeue(&job.job_id, None).await?;
                fleet.retain(|r| r.robot_id != robot_id);
                report.returned += 1;
                continue;
            }

            match self.send_assignment(&job, &robot_id).await {
                Ok(true) => {
                    info!(
                        job_id = %job.job_id,
                        robot_id = %robot_id,
                        priority = %job.priority,
                        "Job claimed"
                    );
                    if let Some(robot) = fleet.iter_mut().find(|r| r.robot_id == robot_id) {
                        robot.current_job_ids.insert(job.job_id.clone());
                    }
                    report.assigned += 1;
                }
                Ok(false) => {
                    warn!(
                        job_id = %job.job_id,
                        robot_id = %robot_id,
                        "Robot not connected, returning job to queue"
                    );
                    self.robots.release(&robot_id, &job.job_id).await;
                    self.queue.requeue(&job.job_id, None).await?;
                    fleet.retain(|r| r.robot_id != robot_id);
                    report.returned += 1;
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "Job cannot be assigned");
                    self.robots.release(&robot_id, &job.job_id).await;
                    let message = e.to_string();
                    let failed = self
                        .queue
                        .update(&job.job_id, &mut |j: &mut Job| {
                            j.fail(e.error_type(), &message, now)
                        })
                        .await?;
                    self.settle(None, failed, bus::JOB_FAILED).await?;
                }
            }
        }

        if report.assigned > 0 || report.returned > 0 {
            debug!(assigned = report.assigned, returned = report.returned, "Dispatch cycle");
        }
        Ok(report)
    }

    async fn send_assignment(&self, job: &Job, robot_id: &str) -> Result<bool> {
        let message = MessageBuilder::job_assign(
            &job.job_id,
            &job.workflow_id,
            &job.workflow_payload,
            AssignOptions {
                workflow_name: Some(job.workflow_name.clone()),
                priority: job.priority.as_wire(),
                timeout_seconds: job.timeout_seconds,
                input: job.input.clone(),
            },
        )?;
        Ok(self.hub.send(robot_id, message).await)
    }

    /// Moves a terminal job into history and frees whatever it held.
    async fn settle(&self, robot_id: Option<&str>, job: Job, event_type: &str) -> Result<Job> {
        if let Some(robot_id) = robot_id {
            self.robots.release(robot_id, &job.job_id).await;
        }
        self.clear_rejections(&job.job_id);
        self.queue.ack(&job.job_id).await?;
        let pruned = self.queue.prune_history(self.settings.history_limit).await?;
        if pruned > 0 {
            debug!(pruned, "Pruned job history");
        }
        self.publish_job(event_type, &job);
        Ok(job)
    }

    // --- robot replies ---

    pub async fn accept(&self, robot_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<Job> {
        let job = self
            .queue
            .update(job_id, &mut |j: &mut Job| {
                owned_by(j, robot_id)?;
                j.start(now)
            })
            .await?;
        info!(job_id = %job_id, robot_id = %robot_id, "Job running");
        self.publish_job(bus::JOB_STARTED, &job);
        Ok(job)
    }

    /// Returns the job to the queue and keeps this robot away from it for the cooldown.
    pub async fn reject(
        &self,
        robot_id: &str,
        job_id: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let current = self
            .queue
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))?;
        owned_by(&current, robot_id)?;
        let job = self.queue.requeue(job_id, None).await?;
        self.robots.release(robot_id, job_id).await;
        let until = now + self.settings.reject_cooldown;
        self.rejections()
            .entry(job_id.to_string())
            .or_default()
            .insert(robot_id.to_string(), until);
        warn!(
            job_id = %job_id,
            robot_id = %robot_id,
            reason = reason.unwrap_or("unspecified"),
            "Job rejected by robot"
        );
        Ok(job)
    }

    pub async fn progress(
        &self,
        robot_id: &str,
        update: &JobProgressPayload,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut implicit_start = false;
        let job = self
            .queue
            .update(&update.job_id, &mut |j: &mut Job| {
                owned_by(j, robot_id)?;
                implicit_start = j.status == JobStatus::Claimed;
                if implicit_start {
                    j.start(now)?;
                }
                if j.status != JobStatus::Running {
                    return Err(OrchestratorError::Validation(format!(
                        "job {} is {}, progress ignored",
                        j.job_id, j.status
                    )));
                }
                j.progress = update.progress.min(100);
                if update.current_node.is_some() {
                    j.current_node = update.current_node.clone();
                }
                Ok(())
            })
            .await?;
        if implicit_start {
            self.publish_job(bus::JOB_STARTED, &job);
        }
        debug!(
            job_id = %job.job_id,
            progress = job.progress,
            node = job.current_node.as_deref().unwrap_or("-"),
            "Job progress"
        );
        Ok(job)
    }

    pub async fn complete(
        &self,
        robot_id: &str,
        outcome: JobCompletePayload,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = self
            .queue
            .update(&outcome.job_id, &mut |j: &mut Job| {
                owned_by(j, robot_id)?;
                j.complete(outcome.result.clone(), outcome.duration_ms, now)
            })
            .await?;
        info!(
            job_id = %job.job_id,
            robot_id = %robot_id,
            duration_ms = job.duration_ms.unwrap_or_default(),
            "Job completed"
        );
        self.settle(Some(robot_id), job, bus::JOB_COMPLETED).await
    }

    /// A robot-reported failure is terminal; retries cover only timeouts and robot loss.
    pub async fn failed(
        &self,
        robot_id: &str,
        failure: JobFailedPayload,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = self
            .queue
            .update(&failure.job_id, &mut |j: &mut Job| {
                owned_by(j, robot_id)?;
                j.fail(&failure.error_type, &failure.error_message, now)?;
                if failure.failed_node.is_some() {
                    j.current_node = failure.failed_node.clone();
                }
                Ok(())
            })
            .await?;
        warn!(
            job_id = %job.job_id,
            robot_id = %robot_id,
            error_type = %failure.error_type,
            error = %failure.error_message,
            "Job failed"
        );
        self.settle(Some(robot_id), job, bus::JOB_FAILED).await
    }

    /// Robot confirmation of a cancel. The job was already cancelled locally.
    pub async fn cancel_acknowledged(&self, robot_id: &str, job_id: &str) {
        self.robots.release(robot_id, job_id).await;
        debug!(job_id = %job_id, robot_id = %robot_id, "Robot confirmed cancellation");
    }

    // --- operator actions ---

    /// Cancels locally right away; the owning robot, if any, is told best-effort.
    pub async fn cancel(&self, job_id: &str, reason: &str, now: DateTime<Utc>) -> Result<Job> {
        let mut holder: Option<String> = None;
        let job = self
            .queue
            .update(job_id, &mut |j: &mut Job| {
                holder = j.assigned_robot_id.clone();
                j.cancel(reason, now)
            })
            .await?;

        if let Some(robot_id) = &holder {
            match MessageBuilder::job_cancel(job_id, reason) {
                Ok(message) => {
                    if !self.hub.send(robot_id, message).await {
                        debug!(job_id = %job_id, robot_id = %robot_id, "Cancel not delivered, robot not connected");
                    }
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "Cannot build cancel message"),
            }
        }
        info!(job_id = %job_id, reason = %reason, "Job cancelled");
        self.settle(holder.as_deref(), job, bus::JOB_CANCELLED).await
    }

    pub async fn set_robot_paused(&self, robot_id: &str, paused: bool) -> Result<()> {
        if !self.robots.set_paused(robot_id, paused).await {
            return Err(OrchestratorError::NotFound(format!("robot {}", robot_id)));
        }
        let message = if paused {
            MessageBuilder::pause(robot_id)
        } else {
            MessageBuilder::resume(robot_id)
        };
        self.hub.send(robot_id, message).await;
        info!(robot_id = %robot_id, paused, "Robot pause state changed");
        Ok(())
    }

    // --- timeouts and robot loss ---

    /// Times out running jobs past their deadline. Returns how many expired.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let running = self
            .queue
            .list(&JobListFilter {
                status: Some(JobStatus::Running),
                limit: None,
            })
            .await?;
        let mut expired = 0;
        for job in running {
            if job.deadline().is_none_or(|deadline| deadline > now) {
                continue;
            }
            expired += 1;
            let reason = format!("job exceeded its {}s timeout", job.timeout_seconds);
            if let Some(robot_id) = &job.assigned_robot_id
                && let Ok(message) = MessageBuilder::job_cancel(&job.job_id, &reason)
            {
                self.hub.send(robot_id, message).await;
            }
            if let Err(e) = self
                .retry_or_fail(&job.job_id, TIMEOUT_ERROR, &reason, now)
                .await
            {
                warn!(job_id = %job.job_id, error = %e, "Timeout handling failed");
            }
        }
        Ok(expired)
    }

    /// `RUNNING -> QUEUED` with backoff while retries remain, else `FAILED`.
    async fn retry_or_fail(
        &self,
        job_id: &str,
        error_type: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut holder: Option<String> = None;
        let job = self
            .queue
            .update(job_id, &mut |j: &mut Job| {
                holder = j.assigned_robot_id.clone();
                if j.retry_count < j.max_retries {
                    let not_before = now + self.settings.backoff(j.retry_count + 1);
                    j.retry(reason, error_type, not_before)
                } else {
                    j.fail(error_type, reason, now)
                }
            })
            .await?;

        if job.status == JobStatus::Queued {
            if let Some(robot_id) = &holder {
                self.robots.release(robot_id, job_id).await;
            }
            warn!(
                job_id = %job_id,
                error_type = %error_type,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                not_before = ?job.not_before,
                "Job requeued for retry"
            );
            Ok(job)
        } else {
            warn!(job_id = %job_id, error_type = %error_type, reason = %reason, "Job failed");
            self.settle(holder.as_deref(), job, bus::JOB_FAILED).await
        }
    }

    /// Claims go back to the queue untouched; running jobs take the retry path.
    pub async fn handle_robot_loss(&self, robot_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut affected = 0;
        for status in [JobStatus::Claimed, JobStatus::Running] {
            let held = self
                .queue
                .list(&JobListFilter {
                    status: Some(status),
                    limit: None,
                })
                .await?;
            for job in held
                .into_iter()
                .filter(|j| j.assigned_robot_id.as_deref() == Some(robot_id))
            {
                affected += 1;
                let handled = match status {
                    JobStatus::Claimed => self.queue.requeue(&job.job_id, None).await.map(|_| {
                        info!(job_id = %job.job_id, robot_id = %robot_id, "Claim released after robot loss");
                    }),
                    _ => self
                        .retry_or_fail(
                            &job.job_id,
                            ROBOT_TIMEOUT_ERROR,
                            &format!("robot {} stopped responding", robot_id),
                            now,
                        )
                        .await
                        .map(|_| ()),
                };
                if let Err(e) = handled {
                    warn!(job_id = %job.job_id, error = %e, "Robot loss handling failed");
                }
                self.robots.release(robot_id, &job.job_id).await;
            }
        }
        Ok(affected)
    }

    /// Explicit `DISCONNECT`: reclaim the robot's jobs, then forget it.
    pub async fn disconnect(&self, robot_id: &str, now: DateTime<Utc>) -> Result<()> {
        let affected = self.handle_robot_loss(robot_id, now).await?;
        if self.robots.remove(robot_id).await.is_some() {
            self.publish_robot(bus::ROBOT_OFFLINE, robot_id);
        }
        info!(robot_id = %robot_id, jobs = affected, "Robot disconnected");
        Ok(())
    }

    pub fn robot_online(&self, robot_id: &str) {
        self.publish_robot(bus::ROBOT_ONLINE, robot_id);
    }

    /// Heartbeat sweep plus `STATUS_REQUEST` fan-out to every online robot.
    pub async fn sweep_robots(&self, now: DateTime<Utc>) -> SweepOutcome {
        let outcome = self
            .robots
            .sweep(now, self.settings.heartbeat_timeout, self.settings.removal_after)
            .await;
        for (robot_id, _) in &outcome.went_offline {
            self.publish_robot(bus::ROBOT_OFFLINE, robot_id);
            if let Err(e) = self.handle_robot_loss(robot_id, now).await {
                warn!(robot_id = %robot_id, error = %e, "Could not reclaim jobs from offline robot");
            }
        }
        for robot_id in &outcome.removed {
            info!(robot_id = %robot_id, "Robot forgotten after prolonged absence");
        }
        for robot_id in self.robots.online_ids().await {
            let request = MessageBuilder::status_request(&robot_id);
            self.hub.send(&robot_id, request).await;
        }
        outcome
    }

    /// Human-readable reason a job is where it is.
    pub async fn explain(&self, job: &Job, now: DateTime<Utc>) -> String {
        match job.status {
            JobStatus::Pending => "submitted, not yet queued".to_string(),
            JobStatus::Queued => self.explain_queued(job, now).await,
            JobStatus::Claimed => format!(
                "assigned to robot {}, waiting for it to accept",
                job.assigned_robot_id.as_deref().unwrap_or("?")
            ),
            JobStatus::Running => {
                let mut text = format!(
                    "running on robot {} ({}%",
                    job.assigned_robot_id.as_deref().unwrap_or("?"),
                    job.progress
                );
                if let Some(node) = &job.current_node {
                    text.push_str(&format!(", at node {}", node));
                }
                text.push(')');
                text
            }
            JobStatus::Completed => match job.duration_ms {
                Some(ms) => format!("completed in {} ms", ms),
                None => "completed".to_string(),
            },
            JobStatus::Failed => format!(
                "failed with {}: {}",
                job.error_type.as_deref().unwrap_or("error"),
                job.error_message.as_deref().unwrap_or("no details")
            ),
            JobStatus::Cancelled => format!(
                "cancelled: {}",
                job.error_message.as_deref().unwrap_or("no reason given")
            ),
        }
    }

    async fn explain_queued(&self, job: &Job, now: DateTime<Utc>) -> String {
        if let Some(not_before) = job.not_before
            && not_before > now
        {
            return format!(
                "waiting for retry {}/{} until {} after {}",
                job.retry_count,
                job.max_retries,
                not_before.to_rfc3339(),
                job.error_type.as_deref().unwrap_or("an error")
            );
        }

        let robots = self.robots.list().await;
        if robots.is_empty() {
            return "waiting for a robot: none are registered".to_string();
        }
        let matching: Vec<&RobotDescriptor> = robots
            .iter()
            .filter(|r| r.matches(&job.required_tags, job.environment.as_deref()))
            .collect();
        if matching.is_empty() {
            let mut wants = Vec::new();
            if !job.required_tags.is_empty() {
                wants.push(format!("tags [{}]", job.required_tags.join(", ")));
            }
            if let Some(env) = &job.environment {
                wants.push(format!("environment {}", env));
            }
            return format!("waiting for a robot with {}", wants.join(" and "));
        }
        let available: Vec<&&RobotDescriptor> =
            matching.iter().filter(|r| r.accepts_work()).collect();
        if available.is_empty() {
            return format!(
                "waiting for a robot: all {} matching robots are busy, paused or offline",
                matching.len()
            );
        }

        let rejected = self.rejection_snapshot(now);
        if let Some(by) = rejected.get(&job.job_id)
            && available.iter().all(|r| by.contains(&r.robot_id))
        {
            let mut names: Vec<&str> = by.iter().map(|s| s.as_str()).collect();
            names.sort_unstable();
            return format!(
                "waiting: rejected by {} within the last {}s",
                names.join(", "),
                self.settings.reject_cooldown.num_seconds()
            );
        }
        "waiting for the next dispatch cycle".to_string()
    }

    // --- background loop ---

    /// Runs dispatch cycles and sweeps until cancelled. Queue errors are
    /// logged and retried on the next tick.
    pub async fn run(
        self: Arc<Self>,
        cycle_every: std::time::Duration,
        sweep_every: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let mut cycle = tokio::time::interval(cycle_every);
        cycle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            policy = ?self.placement.kind(),
            interval_ms = cycle_every.as_millis() as u64,
            "Dispatch engine started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = cycle.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        warn!(error_type = e.error_type(), error = %e, "Dispatch cycle failed, retrying next tick");
                    }
                }
                _ = sweep.tick() => {
                    let now = Utc::now();
                    self.sweep_robots(now).await;
                    if let Err(e) = self.sweep_timeouts(now).await {
                        warn!(error_type = e.error_type(), error = %e, "Timeout sweep failed, retrying next tick");
                    }
                }
            }
        }
        info!("Dispatch engine stopped");
    }
}

#[cfg(test)]
mod tests;
