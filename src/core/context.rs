//! The explicitly wired set of services a running orchestrator shares.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

use crate::core::bridge::{DirectoryWorkflowSource, JobSubmissionBridge};
use crate::core::bus::EventBus;
use crate::core::config::{OrchestratorConfig, PlacementPolicyKind, QueueBackendKind};
use crate::core::dispatch::{ConnectionHub, DispatchEngine, DispatchSettings, Placement};
use crate::core::errors::{OrchestratorError, Result};
use crate::core::queue::{QueueBackend, build_backend};
use crate::core::robot::{RobotRegistry, RobotStatus};
use crate::core::storage::Storage;
use crate::core::triggers::runner::TriggerDeps;
use crate::core::triggers::schedule::SharedScheduler;
use crate::core::triggers::{TriggerRunner, TriggerState};

#[derive(Clone)]
pub struct OrchestratorContext {
    pub config: Arc<OrchestratorConfig>,
    pub storage: Storage,
    pub queue: Arc<dyn QueueBackend>,
    pub robots: Arc<RobotRegistry>,
    pub hub: Arc<ConnectionHub>,
    pub bus: Arc<EventBus>,
    pub bridge: Arc<JobSubmissionBridge>,
    pub engine: Arc<DispatchEngine>,
    pub triggers: Arc<TriggerRunner>,
    pub scheduler: SharedScheduler,
    pub started_at: DateTime<Utc>,
}

/// Snapshot served by `/api/status` and printed by `status`.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct StatusReport {
    pub version: String,
    pub uptime_secs: i64,
    pub queue_backend: QueueBackendKind,
    pub placement_policy: PlacementPolicyKind,
    pub pending_jobs: usize,
    pub robots_total: usize,
    pub robots_online: usize,
    pub robots_busy: usize,
    pub triggers_total: usize,
    pub triggers_running: usize,
    pub triggers_failed: usize,
    pub last_trigger_fired: Option<DateTime<Utc>>,
}

impl OrchestratorContext {
    /// Opens the store at `queue.sqlite_path` and wires everything on top of it.
    pub async fn build(config: OrchestratorConfig) -> Result<Self> {
        let storage = Storage::open(&config.queue.sqlite_path).await?;
        Self::with_storage(config, storage).await
    }

    pub async fn with_storage(config: OrchestratorConfig, storage: Storage) -> Result<Self> {
        let queue = build_backend(&config.queue, Some(storage.clone())).await?;
        let robots = Arc::new(RobotRegistry::new());
        let hub = Arc::new(ConnectionHub::new());
        let bus = Arc::new(EventBus::new());

        let workflows = Arc::new(DirectoryWorkflowSource::new(
            config.triggers.workflows_dir.clone(),
        ));
        let bridge = Arc::new(JobSubmissionBridge::new(
            queue.clone(),
            workflows,
            bus.clone(),
            &config.dispatch,
        ));
        let engine = Arc::new(DispatchEngine::new(
            queue.clone(),
            robots.clone(),
            hub.clone(),
            bus.clone(),
            Placement::new(config.dispatch.placement_policy),
            DispatchSettings::from_config(&config),
        ));

        let scheduler = JobScheduler::new().await.map_err(|e| {
            OrchestratorError::Configuration(format!("cannot create scheduler: {}", e))
        })?;
        let scheduler: SharedScheduler = Arc::new(Mutex::new(scheduler));
        let triggers = Arc::new(TriggerRunner::new(
            storage.clone(),
            bridge.clone(),
            TriggerDeps {
                bus: bus.clone(),
                scheduler: scheduler.clone(),
            },
        ));

        info!(
            backend = ?config.queue.backend,
            policy = ?config.dispatch.placement_policy,
            "Orchestrator context ready"
        );
        Ok(Self {
            config: Arc::new(config),
            storage,
            queue,
            robots,
            hub,
            bus,
            bridge,
            engine,
            triggers,
            scheduler,
            started_at: Utc::now(),
        })
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let robots = self.robots.list().await;
        let triggers = self.triggers.list().await;
        Ok(StatusReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            queue_backend: self.config.queue.backend,
            placement_policy: self.config.dispatch.placement_policy,
            pending_jobs: self.queue.pending_count().await?,
            robots_total: robots.len(),
            robots_online: robots
                .iter()
                .filter(|r| r.status != RobotStatus::Offline)
                .count(),
            robots_busy: robots
                .iter()
                .filter(|r| r.status == RobotStatus::Busy)
                .count(),
            triggers_total: triggers.len(),
            triggers_running: triggers
                .iter()
                .filter(|t| t.state == TriggerState::Running)
                .count(),
            triggers_failed: triggers
                .iter()
                .filter(|t| t.state == TriggerState::Error)
                .count(),
            last_trigger_fired: triggers
                .iter()
                .filter_map(|t| t.config.last_triggered)
                .max(),
        })
    }
}
