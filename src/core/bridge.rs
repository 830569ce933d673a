//! Job submission bridge: the only place jobs are created.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::core::bus::{self, BusEvent, EventBus};
use crate::core::config::DispatchConfig;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::job::{Job, JobPriority, check_timeout};
use crate::core::queue::QueueBackend;
use crate::core::triggers::{TriggerConfig, TriggerEvent, TriggerSink};

/// A workflow definition as handed to robots; the payload is never parsed here.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub workflow_id: String,
    pub name: String,
    pub payload: String,
}

#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn load(&self, workflow_id: &str) -> Result<Workflow>;
}

/// `<dir>/<workflow_id>.json`, read as an opaque string.
pub struct DirectoryWorkflowSource {
    dir: PathBuf,
}

impl DirectoryWorkflowSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn check_workflow_id(workflow_id: &str) -> Result<()> {
    let valid = !workflow_id.is_empty()
        && workflow_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !workflow_id.contains("..");
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::Validation(format!(
            "invalid workflow_id '{}'",
            workflow_id
        )))
    }
}

#[async_trait]
impl WorkflowSource for DirectoryWorkflowSource {
    async fn load(&self, workflow_id: &str) -> Result<Workflow> {
        check_workflow_id(workflow_id)?;
        let path = self.dir.join(format!("{}.json", workflow_id));
        let payload = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OrchestratorError::NotFound(format!("workflow {}", workflow_id))
            } else {
                OrchestratorError::Configuration(format!("cannot read {}: {}", path.display(), e))
            }
        })?;
        Ok(Workflow {
            workflow_id: workflow_id.to_string(),
            name: workflow_id.to_string(),
            payload,
        })
    }
}

/// Direct API submission.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    /// Inline workflow; loaded from the workflow source when absent.
    #[serde(default)]
    pub workflow_json: Option<String>,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

pub struct JobSubmissionBridge {
    queue: Arc<dyn QueueBackend>,
    workflows: Arc<dyn WorkflowSource>,
    bus: Arc<EventBus>,
    default_timeout_secs: u64,
    default_max_retries: u32,
}

impl JobSubmissionBridge {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        workflows: Arc<dyn WorkflowSource>,
        bus: Arc<EventBus>,
        dispatch: &DispatchConfig,
    ) -> Self {
        Self {
            queue,
            workflows,
            bus,
            default_timeout_secs: dispatch.default_timeout_secs,
            default_max_retries: dispatch.default_max_retries,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<Job> {
        check_workflow_id(&request.workflow_id)?;
        let workflow = match request.workflow_json {
            Some(json) if !json.trim().is_empty() => Workflow {
                workflow_id: request.workflow_id.clone(),
                name: request.workflow_id.clone(),
                payload: json,
            },
            _ => self.workflows.load(&request.workflow_id).await?,
        };
        let name = request.workflow_name.unwrap_or(workflow.name);
        let priority = request.priority.unwrap_or_default();
        let mut job = match request.job_id {
            Some(id) if !id.trim().is_empty() => {
                Job::with_id(id, workflow.workflow_id, name, workflow.payload, priority)
            }
            _ => Job::new(workflow.workflow_id, name, workflow.payload, priority),
        };
        job.timeout_seconds =
            check_timeout(request.timeout_seconds.unwrap_or(self.default_timeout_secs))?;
        job.max_retries = request.max_retries.unwrap_or(self.default_max_retries);
        job.required_tags = request.required_tags;
        job.environment = request.environment;
        job.input = request.input;
        job.metadata = request.metadata;
        job.metadata
            .entry("source".to_string())
            .or_insert_with(|| json!("api"));
        self.enqueue(job).await
    }

    pub async fn submit_from_trigger(
        &self,
        trigger: &TriggerConfig,
        event: TriggerEvent,
    ) -> Result<Job> {
        let workflow = self.workflows.load(&trigger.workflow_id).await?;
        let mut job = Job::new(
            workflow.workflow_id,
            trigger.name.clone(),
            workflow.payload,
            trigger.priority,
        );
        job.timeout_seconds = check_timeout(
            trigger
                .config_u64("timeout_seconds")
                .unwrap_or(self.default_timeout_secs),
        )?;
        job.max_retries = trigger
            .config_u64("max_retries")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(self.default_max_retries);
        job.required_tags = trigger.config_list("required_tags");
        job.environment = trigger.config_str("environment").map(|s| s.to_string());
        job.input = event.payload;

        let mut metadata = event.metadata;
        metadata.insert("trigger_id".to_string(), json!(trigger.id));
        metadata.insert("trigger_name".to_string(), json!(trigger.name));
        metadata.insert("triggered_at".to_string(), json!(event.timestamp.to_rfc3339()));
        if let Some(scenario) = &trigger.scenario_id {
            metadata.insert("scenario_id".to_string(), json!(scenario));
        }
        job.metadata = metadata;
        self.enqueue(job).await
    }

    async fn enqueue(&self, job: Job) -> Result<Job> {
        let job_id = job.job_id.clone();
        let outcome = self.queue.enqueue(job).await?;
        if !outcome.accepted {
            return Err(OrchestratorError::Validation(
                outcome
                    .reason
                    .unwrap_or_else(|| "queue rejected the job".to_string()),
            ));
        }
        let job = self
            .queue
            .get(&job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))?;
        info!(
            job_id = %job.job_id,
            workflow_id = %job.workflow_id,
            priority = %job.priority,
            "Job queued"
        );

        let mut data = Map::new();
        data.insert("job_id".to_string(), json!(job.job_id));
        data.insert("workflow_id".to_string(), json!(job.workflow_id));
        data.insert("priority".to_string(), json!(job.priority.as_str()));
        if let Some(trigger_id) = job.metadata.get("trigger_id") {
            data.insert("trigger_id".to_string(), trigger_id.clone());
        }
        self.bus.publish(BusEvent {
            event_type: bus::JOB_QUEUED.to_string(),
            node_id: None,
            timestamp: Utc::now(),
            data,
        });
        Ok(job)
    }
}

#[async_trait]
impl TriggerSink for JobSubmissionBridge {
    async fn deliver(&self, trigger: &TriggerConfig, event: TriggerEvent) -> Result<String> {
        self.submit_from_trigger(trigger, event)
            .await
            .map(|job| job.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobStatus;
    use crate::core::queue::memory::MemoryQueue;
    use crate::core::triggers::TriggerType;
    use tokio::sync::mpsc;

    fn bridge(dir: &std::path::Path) -> (JobSubmissionBridge, Arc<dyn QueueBackend>, Arc<EventBus>) {
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::default());
        let bus = Arc::new(EventBus::new());
        let bridge = JobSubmissionBridge::new(
            queue.clone(),
            Arc::new(DirectoryWorkflowSource::new(dir)),
            bus.clone(),
            &DispatchConfig::default(),
        );
        (bridge, queue, bus)
    }

    #[tokio::test]
    async fn trigger_event_becomes_a_queued_job() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("invoices.json"), "{\"nodes\":[]}").unwrap();
        let (bridge, queue, bus) = bridge(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(bus::JOB_QUEUED, tx);

        let trigger = TriggerConfig::new("Invoices", TriggerType::Webhook, "invoices")
            .setting("max_retries", json!(2));
        let mut payload = Map::new();
        payload.insert("x".to_string(), json!(1));
        let event = TriggerEvent {
            trigger_id: trigger.id.clone(),
            payload,
            metadata: Map::new(),
            timestamp: Utc::now(),
        };

        let job_id = bridge.deliver(&trigger, event).await.unwrap();
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.workflow_payload, "{\"nodes\":[]}");
        assert_eq!(job.input["x"], 1);
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.metadata["trigger_id"], json!(trigger.id));

        let published = rx.try_recv().unwrap();
        assert_eq!(published.data["job_id"], json!(job_id));
    }

    #[tokio::test]
    async fn missing_workflow_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _, _) = bridge(dir.path());
        let err = bridge
            .submit(SubmitRequest {
                workflow_id: "ghost".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "NotFoundError");
    }

    #[tokio::test]
    async fn inline_workflow_and_traversal_checks() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _, _) = bridge(dir.path());
        let job = bridge
            .submit(SubmitRequest {
                job_id: Some("job-1".to_string()),
                workflow_id: "adhoc".to_string(),
                workflow_json: Some("{}".to_string()),
                priority: Some(JobPriority::High),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(job.job_id, "job-1");
        assert_eq!(job.priority, JobPriority::High);
        assert_eq!(job.timeout_seconds, 3600);

        let dup = bridge
            .submit(SubmitRequest {
                job_id: Some("job-1".to_string()),
                workflow_id: "adhoc".to_string(),
                workflow_json: Some("{}".to_string()),
                ..Default::default()
            })
            .await;
        assert!(dup.is_err());

        let err = bridge
            .submit(SubmitRequest {
                workflow_id: "../etc/passwd".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "ValidationError");
    }

    #[tokio::test]
    async fn out_of_range_timeouts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("invoices.json"), "{}").unwrap();
        let (bridge, queue, _) = bridge(dir.path());

        for secs in [0, crate::core::job::MAX_TIMEOUT_SECONDS + 1, 10_000_000_000_000] {
            let err = bridge
                .submit(SubmitRequest {
                    workflow_id: "invoices".to_string(),
                    timeout_seconds: Some(secs),
                    ..Default::default()
                })
                .await
                .unwrap_err();
            assert_eq!(err.error_type(), "ValidationError");
        }

        let trigger = TriggerConfig::new("Invoices", TriggerType::Manual, "invoices")
            .setting("timeout_seconds", json!(10_000_000_000_000u64));
        let event = TriggerEvent {
            trigger_id: trigger.id.clone(),
            payload: Map::new(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        };
        let err = bridge.submit_from_trigger(&trigger, event).await.unwrap_err();
        assert_eq!(err.error_type(), "ValidationError");
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }
}
