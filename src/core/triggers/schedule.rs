use serde_json::{Map, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{TriggerConfig, TriggerEmitter};
use crate::core::errors::{OrchestratorError, Result};

pub type SharedScheduler = Arc<Mutex<JobScheduler>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// Six-field cron expression (seconds first).
    Cron(String),
    Interval(Duration),
}

impl Recurrence {
    pub fn of(config: &TriggerConfig) -> Result<Self> {
        match (config.config_str("cron"), config.config_u64("interval_seconds")) {
            (Some(cron), None) => Ok(Recurrence::Cron(cron.trim().to_string())),
            (None, Some(secs)) if secs > 0 => Ok(Recurrence::Interval(Duration::from_secs(secs))),
            (None, Some(_)) => Err(OrchestratorError::Configuration(
                "interval_seconds must be positive".to_string(),
            )),
            (Some(_), Some(_)) => Err(OrchestratorError::Configuration(
                "set either 'cron' or 'interval_seconds', not both".to_string(),
            )),
            (None, None) => Err(OrchestratorError::Configuration(
                "schedule trigger requires 'cron' or 'interval_seconds'".to_string(),
            )),
        }
    }

    fn describe(&self) -> String {
        match self {
            Recurrence::Cron(expr) => expr.clone(),
            Recurrence::Interval(every) => format!("every {}s", every.as_secs()),
        }
    }
}

/// Builds the scheduler job; constructing it is also how the cron expression is validated.
fn build_job(recurrence: &Recurrence, emitter: Option<TriggerEmitter>) -> Result<Job> {
    let label = recurrence.describe();
    let fire = move |_uuid: Uuid, _l: JobScheduler| {
        let emitter = emitter.clone();
        let label = label.clone();
        Box::pin(async move {
            let Some(emitter) = emitter else {
                return;
            };
            let mut payload = Map::new();
            payload.insert("scheduled_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
            payload.insert("schedule".to_string(), json!(label));
            let mut metadata = Map::new();
            metadata.insert("source".to_string(), json!("schedule"));
            emitter.emit(payload, metadata).await;
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    };
    let job = match recurrence {
        Recurrence::Cron(expr) => Job::new_async(expr.as_str(), fire),
        Recurrence::Interval(every) => Job::new_repeated_async(*every, fire),
    };
    job.map_err(|e| OrchestratorError::Configuration(format!("invalid schedule: {}", e)))
}

pub fn validate_config(config: &TriggerConfig) -> Result<()> {
    let recurrence = Recurrence::of(config)?;
    build_job(&recurrence, None).map(|_| ())
}

pub struct ScheduleTrigger {
    scheduler: SharedScheduler,
    job_id: Option<Uuid>,
    error: Option<String>,
}

impl ScheduleTrigger {
    pub fn new(scheduler: SharedScheduler) -> Self {
        Self {
            scheduler,
            job_id: None,
            error: None,
        }
    }

    pub(super) async fn start(&mut self, emitter: TriggerEmitter) -> bool {
        self.stop().await;
        let trigger_id = emitter.trigger().id.clone();
        let result = async {
            let recurrence = Recurrence::of(emitter.trigger())?;
            let job = build_job(&recurrence, Some(emitter.clone()))?;
            let id = self
                .scheduler
                .lock()
                .await
                .add(job)
                .await
                .map_err(|e| OrchestratorError::Configuration(format!("cannot schedule: {}", e)))?;
            info!(trigger_id = %trigger_id, schedule = %recurrence.describe(), "Schedule registered");
            Ok::<Uuid, OrchestratorError>(id)
        }
        .await;

        match result {
            Ok(id) => {
                self.job_id = Some(id);
                self.error = None;
                true
            }
            Err(e) => {
                error!(trigger_id = %trigger_id, error = %e, "Schedule trigger failed to start");
                self.error = Some(e.to_string());
                false
            }
        }
    }

    pub(super) async fn stop(&mut self) {
        if let Some(id) = self.job_id.take()
            && let Err(e) = self.scheduler.lock().await.remove(&id).await
        {
            warn!(job = %id, error = %e, "Failed to remove scheduled job");
        }
    }

    pub(super) fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::triggers::TriggerType;

    fn schedule(key: &str, value: serde_json::Value) -> TriggerConfig {
        TriggerConfig::new("nightly", TriggerType::Schedule, "wf").setting(key, value)
    }

    #[test]
    fn cron_with_seconds_field_is_accepted() {
        assert!(validate_config(&schedule("cron", json!("0 0/5 * * * *"))).is_ok());
    }

    #[test]
    fn malformed_cron_is_a_configuration_error() {
        let err = validate_config(&schedule("cron", json!("every tuesday"))).unwrap_err();
        assert_eq!(err.error_type(), "ConfigurationError");
    }

    #[test]
    fn interval_must_be_positive_and_exclusive_with_cron() {
        assert!(validate_config(&schedule("interval_seconds", json!(30))).is_ok());
        assert!(validate_config(&schedule("interval_seconds", json!(0))).is_err());
        let both = schedule("cron", json!("0 * * * * *")).setting("interval_seconds", json!(5));
        assert!(validate_config(&both).is_err());
        let neither = TriggerConfig::new("n", TriggerType::Schedule, "wf");
        assert!(validate_config(&neither).is_err());
    }
}
