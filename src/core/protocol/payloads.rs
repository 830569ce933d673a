use serde_json::{Map, Value};

use crate::core::robot::ResourceGauges;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HeartbeatPayload {
    pub robot_id: String,
    #[serde(default)]
    pub current_jobs: Vec<String>,
    #[serde(flatten)]
    pub gauges: ResourceGauges,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DisconnectPayload {
    pub robot_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct JobRefPayload {
    pub job_id: String,
    #[serde(default)]
    pub robot_id: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct JobRejectPayload {
    pub job_id: String,
    #[serde(default)]
    pub robot_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct JobProgressPayload {
    pub job_id: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct JobCompletePayload {
    pub job_id: String,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct JobFailedPayload {
    pub job_id: String,
    #[serde(default = "default_failure_message")]
    pub error_message: String,
    #[serde(default = "default_failure_type")]
    pub error_type: String,
    #[serde(default)]
    pub failed_node: Option<String>,
}

fn default_failure_message() -> String {
    "robot reported failure".to_string()
}

fn default_failure_type() -> String {
    "ExecutionError".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StatusResponsePayload {
    pub robot_id: String,
    #[serde(default)]
    pub current_jobs: Vec<String>,
    #[serde(flatten)]
    pub gauges: ResourceGauges,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LogBatchPayload {
    #[serde(default)]
    pub entries: Vec<LogRecord>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
