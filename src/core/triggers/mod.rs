//! Trigger subsystem: listeners that turn external occurrences into job submissions.
//!
//! The variant set is closed ([`TriggerType`] / [`TriggerInstance`]). Every
//! implementation funnels through a shared [`TriggerEmitter`], which enforces the
//! trigger's cooldown before handing the event to a [`TriggerSink`].

pub mod app_event;
pub mod file_watch;
pub mod runner;
pub mod schedule;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::errors::{OrchestratorError, Result};
use crate::core::job::{JobPriority, MAX_TIMEOUT_SECONDS};

pub use runner::{TriggerRunner, TriggerView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    FileWatch,
    AppEvent,
    Schedule,
    Manual,
}

impl TriggerType {
    pub const ALL: [TriggerType; 5] = [
        TriggerType::Webhook,
        TriggerType::FileWatch,
        TriggerType::AppEvent,
        TriggerType::Schedule,
        TriggerType::Manual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Webhook => "webhook",
            TriggerType::FileWatch => "file_watch",
            TriggerType::AppEvent => "app_event",
            TriggerType::Schedule => "schedule",
            TriggerType::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "generate_trigger_id")]
    pub id: String,
    pub name: String,
    pub trigger_type: TriggerType,
    pub workflow_id: String,
    #[serde(default)]
    pub scenario_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub cooldown_seconds: u64,
    /// Variant-specific settings.
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub trigger_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
}

fn generate_trigger_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_enabled() -> bool {
    true
}

impl TriggerConfig {
    pub fn new(
        name: impl Into<String>,
        trigger_type: TriggerType,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_trigger_id(),
            name: name.into(),
            trigger_type,
            workflow_id: workflow_id.into(),
            scenario_id: None,
            enabled: true,
            priority: JobPriority::Normal,
            cooldown_seconds: 0,
            config: Map::new(),
            trigger_count: 0,
            success_count: 0,
            last_triggered: None,
        }
    }

    pub fn setting(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    /// A string or a list of strings under `key`.
    pub fn config_list(&self, key: &str) -> Vec<String> {
        match self.config.get(key) {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Checks shared fields, then the variant's own settings.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "trigger name is required".to_string(),
            ));
        }
        if self.workflow_id.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "trigger workflow_id is required".to_string(),
            ));
        }
        if let Some(secs) = self.config_u64("timeout_seconds")
            && (secs == 0 || secs > MAX_TIMEOUT_SECONDS)
        {
            return Err(OrchestratorError::Configuration(format!(
                "trigger timeout_seconds must be between 1 and {}",
                MAX_TIMEOUT_SECONDS
            )));
        }
        match self.trigger_type {
            TriggerType::Webhook => webhook::validate_config(self),
            TriggerType::FileWatch => file_watch::validate_config(self),
            TriggerType::AppEvent => app_event::validate_config(self),
            TriggerType::Schedule => schedule::validate_config(self),
            TriggerType::Manual => Ok(()),
        }
    }
}

/// One occurrence detected by a trigger. Lives only until the bridge builds a job.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TriggerEvent {
    pub trigger_id: String,
    pub payload: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Where emitted events go once they pass the cooldown.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    /// Returns the id of the job created for the event.
    async fn deliver(&self, trigger: &TriggerConfig, event: TriggerEvent) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    Submitted(String),
    Suppressed { retry_after: Duration },
    Failed(String),
}

/// Shared `emit()` for every trigger variant.
#[derive(Clone)]
pub struct TriggerEmitter {
    trigger: Arc<TriggerConfig>,
    last_fired: Arc<Mutex<Option<Instant>>>,
    sink: Arc<dyn TriggerSink>,
}

impl TriggerEmitter {
    pub fn new(trigger: TriggerConfig, sink: Arc<dyn TriggerSink>) -> Self {
        Self {
            trigger: Arc::new(trigger),
            last_fired: Arc::new(Mutex::new(None)),
            sink,
        }
    }

    pub fn trigger(&self) -> &TriggerConfig {
        &self.trigger
    }

    pub async fn emit(&self, payload: Map<String, Value>, metadata: Map<String, Value>) -> EmitOutcome {
        let cooldown = Duration::from_secs(self.trigger.cooldown_seconds);
        {
            let mut last = self.last_fired.lock().await;
            let now = Instant::now();
            if let Some(prev) = *last {
                let elapsed = now.duration_since(prev);
                if elapsed < cooldown {
                    debug!(
                        trigger_id = %self.trigger.id,
                        remaining_ms = (cooldown - elapsed).as_millis() as u64,
                        "Trigger suppressed by cooldown"
                    );
                    return EmitOutcome::Suppressed {
                        retry_after: cooldown - elapsed,
                    };
                }
            }
            *last = Some(now);
        }

        let mut metadata = metadata;
        metadata
            .entry("trigger_type".to_string())
            .or_insert_with(|| Value::String(self.trigger.trigger_type.as_str().to_string()));
        let event = TriggerEvent {
            trigger_id: self.trigger.id.clone(),
            payload,
            metadata,
            timestamp: Utc::now(),
        };

        match self.sink.deliver(&self.trigger, event).await {
            Ok(job_id) => {
                info!(trigger_id = %self.trigger.id, job_id = %job_id, "Trigger fired");
                EmitOutcome::Submitted(job_id)
            }
            Err(e) => {
                warn!(trigger_id = %self.trigger.id, error = %e, "Trigger fired but job submission failed");
                EmitOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Runtime state reported per trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Stopped,
    Running,
    Error,
}

/// Concrete listener for one trigger, selected by `trigger_type`.
///
/// Webhook and manual triggers are passive: they are fired from the HTTP
/// surface through the emitter the runner keeps for them.
pub enum TriggerInstance {
    Webhook,
    FileWatch(file_watch::FileWatchTrigger),
    AppEvent(app_event::AppEventTrigger),
    Schedule(schedule::ScheduleTrigger),
    Manual,
}

impl TriggerInstance {
    pub fn for_config(config: &TriggerConfig, deps: &runner::TriggerDeps) -> Self {
        match config.trigger_type {
            TriggerType::Webhook => TriggerInstance::Webhook,
            TriggerType::FileWatch => {
                TriggerInstance::FileWatch(file_watch::FileWatchTrigger::default())
            }
            TriggerType::AppEvent => {
                TriggerInstance::AppEvent(app_event::AppEventTrigger::new(deps.bus.clone()))
            }
            TriggerType::Schedule => {
                TriggerInstance::Schedule(schedule::ScheduleTrigger::new(deps.scheduler.clone()))
            }
            TriggerType::Manual => TriggerInstance::Manual,
        }
    }

    /// Never fails past this boundary: a failed start records its error and returns false.
    pub async fn start(&mut self, emitter: TriggerEmitter) -> bool {
        match self {
            TriggerInstance::Webhook | TriggerInstance::Manual => true,
            TriggerInstance::FileWatch(t) => t.start(emitter),
            TriggerInstance::AppEvent(t) => t.start(emitter),
            TriggerInstance::Schedule(t) => t.start(emitter).await,
        }
    }

    /// Idempotent; releases watchers, subscriptions and scheduled jobs.
    pub async fn stop(&mut self) {
        match self {
            TriggerInstance::Webhook | TriggerInstance::Manual => {}
            TriggerInstance::FileWatch(t) => t.stop(),
            TriggerInstance::AppEvent(t) => t.stop(),
            TriggerInstance::Schedule(t) => t.stop().await,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            TriggerInstance::Webhook | TriggerInstance::Manual => None,
            TriggerInstance::FileWatch(t) => t.last_error(),
            TriggerInstance::AppEvent(t) => t.last_error(),
            TriggerInstance::Schedule(t) => t.last_error(),
        }
    }
}

#[cfg(test)]
mod tests;
