//! Orchestrator <-> robot wire protocol.
//!
//! Every frame is one JSON object:
//! `{ "type", "id", "timestamp", "payload", "correlation_id"? }`.
//! `correlation_id` is only present on replies and pairs them with the
//! request's `id`. Unknown `type` values are rejected by [`Message::from_wire`]
//! so the connection handler can answer with an `ERROR` frame.

mod builder;
pub mod payloads;

pub use builder::{AssignOptions, MessageBuilder};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::errors::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    RegisterAck,
    Heartbeat,
    HeartbeatAck,
    Disconnect,
    JobAssign,
    JobAccept,
    JobReject,
    JobProgress,
    JobComplete,
    JobFailed,
    JobCancel,
    JobCancelled,
    StatusRequest,
    StatusResponse,
    LogEntry,
    LogBatch,
    Pause,
    Resume,
    Shutdown,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 21] = [
        MessageType::Register,
        MessageType::RegisterAck,
        MessageType::Heartbeat,
        MessageType::HeartbeatAck,
        MessageType::Disconnect,
        MessageType::JobAssign,
        MessageType::JobAccept,
        MessageType::JobReject,
        MessageType::JobProgress,
        MessageType::JobComplete,
        MessageType::JobFailed,
        MessageType::JobCancel,
        MessageType::JobCancelled,
        MessageType::StatusRequest,
        MessageType::StatusResponse,
        MessageType::LogEntry,
        MessageType::LogBatch,
        MessageType::Pause,
        MessageType::Resume,
        MessageType::Shutdown,
        MessageType::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Register => "REGISTER",
            MessageType::RegisterAck => "REGISTER_ACK",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::HeartbeatAck => "HEARTBEAT_ACK",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::JobAssign => "JOB_ASSIGN",
            MessageType::JobAccept => "JOB_ACCEPT",
            MessageType::JobReject => "JOB_REJECT",
            MessageType::JobProgress => "JOB_PROGRESS",
            MessageType::JobComplete => "JOB_COMPLETE",
            MessageType::JobFailed => "JOB_FAILED",
            MessageType::JobCancel => "JOB_CANCEL",
            MessageType::JobCancelled => "JOB_CANCELLED",
            MessageType::StatusRequest => "STATUS_REQUEST",
            MessageType::StatusResponse => "STATUS_RESPONSE",
            MessageType::LogEntry => "LOG_ENTRY",
            MessageType::LogBatch => "LOG_BATCH",
            MessageType::Pause => "PAUSE",
            MessageType::Resume => "RESUME",
            MessageType::Shutdown => "SHUTDOWN",
            MessageType::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Types a robot is allowed to send to the orchestrator.
    pub fn is_robot_originated(self) -> bool {
        matches!(
            self,
            MessageType::Register
                | MessageType::Heartbeat
                | MessageType::Disconnect
                | MessageType::JobAccept
                | MessageType::JobReject
                | MessageType::JobProgress
                | MessageType::JobComplete
                | MessageType::JobFailed
                | MessageType::JobCancelled
                | MessageType::StatusResponse
                | MessageType::LogEntry
                | MessageType::LogBatch
                | MessageType::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(msg_type: MessageType, payload: Map<String, Value>) -> Self {
        Self {
            msg_type,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
            correlation_id: None,
        }
    }

    pub fn correlated(mut self, request_id: impl Into<String>) -> Self {
        self.correlation_id = Some(request_id.into());
        self
    }

    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses one frame. Fails closed on malformed JSON and unknown types.
    pub fn from_wire(raw: &str) -> std::result::Result<Self, WireError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| WireError {
            request_id: None,
            reason: format!("malformed frame: {}", e),
        })?;
        let request_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let type_name = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WireError {
                request_id: request_id.clone(),
                reason: "missing message type".to_string(),
            })?
            .to_string();
        if MessageType::parse(&type_name).is_none() {
            return Err(WireError {
                request_id,
                reason: format!("unknown message type '{}'", type_name),
            });
        }

        serde_json::from_value(value).map_err(|e| WireError {
            request_id,
            reason: format!("invalid {} frame: {}", type_name, e),
        })
    }

    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            OrchestratorError::Protocol(format!(
                "invalid {} payload: {}",
                self.msg_type.as_str(),
                e
            ))
        })
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// A frame that could not be decoded; carries the request id when one was readable.
#[derive(Debug, Clone, PartialEq)]
pub struct WireError {
    pub request_id: Option<String>,
    pub reason: String,
}

impl From<WireError> for OrchestratorError {
    fn from(e: WireError) -> Self {
        OrchestratorError::Protocol(e.reason)
    }
}
