use serde_json::{Map, Value, json};

use super::payloads::LogRecord;
use super::{Message, MessageType};
use crate::core::errors::{OrchestratorError, Result};
use crate::core::robot::{ResourceGauges, RobotRegistration};

pub const DEFAULT_ASSIGN_PRIORITY: u8 = 1;
pub const DEFAULT_ASSIGN_TIMEOUT_SECONDS: u64 = 3600;

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OrchestratorError::Protocol(format!(
            "'{}' is required",
            field
        )));
    }
    Ok(())
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Options for `JOB_ASSIGN` beyond the required fields.
#[derive(Debug, Clone)]
pub struct AssignOptions {
    pub workflow_name: Option<String>,
    pub priority: u8,
    pub timeout_seconds: u64,
    pub input: Map<String, Value>,
}

impl Default for AssignOptions {
    fn default() -> Self {
        Self {
            workflow_name: None,
            priority: DEFAULT_ASSIGN_PRIORITY,
            timeout_seconds: DEFAULT_ASSIGN_TIMEOUT_SECONDS,
            input: Map::new(),
        }
    }
}

/// One constructor per message type.
pub struct MessageBuilder;

impl MessageBuilder {
    // --- connection ---

    pub fn register(reg: &RobotRegistration) -> Result<Message> {
        require("robot_id", &reg.robot_id)?;
        let payload = serde_json::to_value(reg)?;
        Ok(Message::new(MessageType::Register, object(payload)))
    }

    pub fn register_ack(
        request: &Message,
        success: bool,
        message: &str,
        config: Map<String, Value>,
    ) -> Message {
        Message::new(
            MessageType::RegisterAck,
            object(json!({
                "success": success,
                "message": message,
                "config": config,
            })),
        )
        .correlated(&request.id)
    }

    pub fn heartbeat(
        robot_id: &str,
        current_jobs: &[String],
        gauges: ResourceGauges,
    ) -> Result<Message> {
        require("robot_id", robot_id)?;
        Ok(Message::new(
            MessageType::Heartbeat,
            object(json!({
                "robot_id": robot_id,
                "current_jobs": current_jobs,
                "cpu_percent": gauges.cpu_percent,
                "memory_percent": gauges.memory_percent,
                "disk_percent": gauges.disk_percent,
            })),
        ))
    }

    pub fn heartbeat_ack(request: &Message) -> Message {
        Message::new(MessageType::HeartbeatAck, Map::new()).correlated(&request.id)
    }

    pub fn disconnect(robot_id: &str, reason: &str) -> Result<Message> {
        require("robot_id", robot_id)?;
        Ok(Message::new(
            MessageType::Disconnect,
            object(json!({ "robot_id": robot_id, "reason": reason })),
        ))
    }

    // --- job lifecycle ---

    pub fn job_assign(
        job_id: &str,
        workflow_id: &str,
        workflow_json: &str,
        options: AssignOptions,
    ) -> Result<Message> {
        require("job_id", job_id)?;
        require("workflow_id", workflow_id)?;
        require("workflow_json", workflow_json)?;
        let mut payload = object(json!({
            "job_id": job_id,
            "workflow_id": workflow_id,
            "workflow_json": workflow_json,
            "priority": options.priority,
            "timeout_seconds": options.timeout_seconds,
            "input": options.input,
        }));
        if let Some(name) = options.workflow_name {
            payload.insert("workflow_name".to_string(), Value::String(name));
        }
        Ok(Message::new(MessageType::JobAssign, payload))
    }

    pub fn job_accept(job_id: &str, robot_id: &str, assign: Option<&Message>) -> Result<Message> {
        require("job_id", job_id)?;
        let msg = Message::new(
            MessageType::JobAccept,
            object(json!({ "job_id": job_id, "robot_id": robot_id })),
        );
        Ok(match assign {
            Some(req) => msg.correlated(&req.id),
            None => msg,
        })
    }

    pub fn job_reject(
        job_id: &str,
        robot_id: &str,
        reason: &str,
        assign: Option<&Message>,
    ) -> Result<Message> {
        require("job_id", job_id)?;
        let msg = Message::new(
            MessageType::JobReject,
            object(json!({ "job_id": job_id, "robot_id": robot_id, "reason": reason })),
        );
        Ok(match assign {
            Some(req) => msg.correlated(&req.id),
            None => msg,
        })
    }

    pub fn job_progress(
        job_id: &str,
        progress: u8,
        current_node: Option<&str>,
        message: Option<&str>,
    ) -> Result<Message> {
        require("job_id", job_id)?;
        Ok(Message::new(
            MessageType::JobProgress,
            object(json!({
                "job_id": job_id,
                "progress": progress.min(100),
                "current_node": current_node,
                "message": message,
            })),
        ))
    }

    pub fn job_complete(
        job_id: &str,
        result: Map<String, Value>,
        duration_ms: u64,
    ) -> Result<Message> {
        require("job_id", job_id)?;
        Ok(Message::new(
            MessageType::JobComplete,
            object(json!({
                "job_id": job_id,
                "result": result,
                "duration_ms": duration_ms,
            })),
        ))
    }

    pub fn job_failed(
        job_id: &str,
        error_message: &str,
        error_type: &str,
        failed_node: Option<&str>,
    ) -> Result<Message> {
        require("job_id", job_id)?;
        let error_type = if error_type.trim().is_empty() {
            "ExecutionError"
        } else {
            error_type
        };
        Ok(Message::new(
            MessageType::JobFailed,
            object(json!({
                "job_id": job_id,
                "error_message": error_message,
                "error_type": error_type,
                "failed_node": failed_node,
            })),
        ))
    }

    pub fn job_cancel(job_id: &str, reason: &str) -> Result<Message> {
        require("job_id", job_id)?;
        Ok(Message::new(
            MessageType::JobCancel,
            object(json!({ "job_id": job_id, "reason": reason })),
        ))
    }

    pub fn job_cancelled(job_id: &str, cancel: Option<&Message>) -> Result<Message> {
        require("job_id", job_id)?;
        let msg = Message::new(
            MessageType::JobCancelled,
            object(json!({ "job_id": job_id })),
        );
        Ok(match cancel {
            Some(req) => msg.correlated(&req.id),
            None => msg,
        })
    }

    // --- status ---

    pub fn status_request(robot_id: &str) -> Message {
        Message::new(
            MessageType::StatusRequest,
            object(json!({ "robot_id": robot_id })),
        )
    }

    pub fn status_response(
        request: &Message,
        robot_id: &str,
        current_jobs: &[String],
        gauges: ResourceGauges,
    ) -> Message {
        Message::new(
            MessageType::StatusResponse,
            object(json!({
                "robot_id": robot_id,
                "current_jobs": current_jobs,
                "cpu_percent": gauges.cpu_percent,
                "memory_percent": gauges.memory_percent,
                "disk_percent": gauges.disk_percent,
            })),
        )
        .correlated(&request.id)
    }

    // --- logs ---

    pub fn log_entry(record: &LogRecord) -> Result<Message> {
        require("message", &record.message)?;
        Ok(Message::new(
            MessageType::LogEntry,
            object(serde_json::to_value(record)?),
        ))
    }

    pub fn log_batch(entries: &[LogRecord]) -> Result<Message> {
        Ok(Message::new(
            MessageType::LogBatch,
            object(json!({ "entries": entries })),
        ))
    }

    // --- control ---

    pub fn pause(robot_id: &str) -> Message {
        Message::new(MessageType::Pause, object(json!({ "robot_id": robot_id })))
    }

    pub fn resume(robot_id: &str) -> Message {
        Message::new(MessageType::Resume, object(json!({ "robot_id": robot_id })))
    }

    pub fn shutdown(robot_id: &str, graceful: bool) -> Message {
        Message::new(
            MessageType::Shutdown,
            object(json!({ "robot_id": robot_id, "graceful": graceful })),
        )
    }

    pub fn error(code: &str, message: &str, correlation_id: Option<&str>) -> Message {
        let msg = Message::new(
            MessageType::Error,
            object(json!({ "code": code, "message": message })),
        );
        match correlation_id {
            Some(id) => msg.correlated(id),
            None => msg,
        }
    }
}
