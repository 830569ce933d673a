use chrono::Utc;
use serde_json::{Map, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::DispatchEngine;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::protocol::payloads::{
    DisconnectPayload, ErrorPayload, HeartbeatPayload, JobCompletePayload, JobFailedPayload,
    JobProgressPayload, JobRefPayload, JobRejectPayload, LogBatchPayload, LogRecord,
    StatusResponsePayload,
};
use crate::core::protocol::{Message, MessageBuilder, MessageType};
use crate::core::robot::RobotRegistration;

/// Per-connection state. A connection speaks for exactly one robot once registered.
pub struct RobotSession {
    pub connection_id: u64,
    pub robot_id: Option<String>,
    pub outbound: mpsc::UnboundedSender<Message>,
}

impl RobotSession {
    pub fn new(connection_id: u64, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            connection_id,
            robot_id: None,
            outbound,
        }
    }
}

fn log_robot_record(robot_id: &str, record: &LogRecord) {
    let job_id = record.job_id.as_deref().unwrap_or("-");
    let node = record.node_id.as_deref().unwrap_or("-");
    match record.level.to_ascii_lowercase().as_str() {
        "error" => error!(robot_id = %robot_id, job_id, node, "{}", record.message),
        "warn" | "warning" => warn!(robot_id = %robot_id, job_id, node, "{}", record.message),
        "debug" | "trace" => debug!(robot_id = %robot_id, job_id, node, "{}", record.message),
        _ => info!(robot_id = %robot_id, job_id, node, "{}", record.message),
    }
}

impl DispatchEngine {
    /// Handles one inbound text frame and returns the reply to send back, if any.
    ///
    /// Malformed frames, unknown types and failed operations are answered with
    /// `ERROR`; the connection stays open.
    pub async fn handle_frame(&self, session: &mut RobotSession, raw: &str) -> Option<Message> {
        let message = match Message::from_wire(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(connection = session.connection_id, reason = %e.reason, "Rejected robot frame");
                return Some(MessageBuilder::error(
                    "ProtocolError",
                    &e.reason,
                    e.request_id.as_deref(),
                ));
            }
        };

        match self.handle_message(session, &message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    connection = session.connection_id,
                    robot_id = session.robot_id.as_deref().unwrap_or("-"),
                    msg_type = message.msg_type.as_str(),
                    error = %e,
                    "Robot message failed"
                );
                Some(MessageBuilder::error(
                    e.error_type(),
                    &e.to_string(),
                    Some(&message.id),
                ))
            }
        }
    }

    async fn handle_message(
        &self,
        session: &mut RobotSession,
        message: &Message,
    ) -> Result<Option<Message>> {
        if !message.msg_type.is_robot_originated() {
            return Err(OrchestratorError::Protocol(format!(
                "{} is not accepted from robots",
                message.msg_type.as_str()
            )));
        }
        if message.msg_type == MessageType::Register {
            return self.register(session, message).await.map(Some);
        }
        let Some(robot_id) = session.robot_id.clone() else {
            return Err(OrchestratorError::Protocol(
                "robot must REGISTER before sending other messages".to_string(),
            ));
        };
        let now = Utc::now();

        match message.msg_type {
            MessageType::Heartbeat => {
                let beat: HeartbeatPayload = message.parse_payload()?;
                if beat.robot_id != robot_id {
                    return Err(OrchestratorError::Protocol(format!(
                        "heartbeat for {} on connection of {}",
                        beat.robot_id, robot_id
                    )));
                }
                if !self.robots.heartbeat(&robot_id, Some(beat.gauges), now).await {
                    session.robot_id = None;
                    return Err(OrchestratorError::NotFound(format!(
                        "robot {} is not registered",
                        robot_id
                    )));
                }
                Ok(Some(MessageBuilder::heartbeat_ack(message)))
            }
            MessageType::Disconnect => {
                let bye: DisconnectPayload = message.parse_payload()?;
                info!(
                    robot_id = %robot_id,
                    reason = bye.reason.as_deref().unwrap_or("none"),
                    "Robot requested disconnect"
                );
                self.disconnect(&robot_id, now).await?;
                self.hub.detach(&robot_id, session.connection_id).await;
                session.robot_id = None;
                Ok(None)
            }
            MessageType::JobAccept => {
                let r: JobRefPayload = message.parse_payload()?;
                self.accept(&robot_id, &r.job_id, now).await?;
                Ok(None)
            }
            MessageType::JobReject => {
                let r: JobRejectPayload = message.parse_payload()?;
                self.reject(&robot_id, &r.job_id, r.reason.as_deref(), now)
                    .await?;
                Ok(None)
            }
            MessageType::JobProgress => {
                let p: JobProgressPayload = message.parse_payload()?;
                self.progress(&robot_id, &p, now).await?;
                Ok(None)
            }
            MessageType::JobComplete => {
                let p: JobCompletePayload = message.parse_payload()?;
                self.complete(&robot_id, p, now).await?;
                Ok(None)
            }
            MessageType::JobFailed => {
                let p: JobFailedPayload = message.parse_payload()?;
                self.failed(&robot_id, p, now).await?;
                Ok(None)
            }
            MessageType::JobCancelled => {
                let r: JobRefPayload = message.parse_payload()?;
                self.cancel_acknowledged(&robot_id, &r.job_id).await;
                Ok(None)
            }
            MessageType::StatusResponse => {
                let status: StatusResponsePayload = message.parse_payload()?;
                self.robots
                    .heartbeat(&robot_id, Some(status.gauges), now)
                    .await;
                debug!(
                    robot_id = %robot_id,
                    jobs = status.current_jobs.len(),
                    cpu = status.gauges.cpu_percent,
                    "Robot status"
                );
                Ok(None)
            }
            MessageType::LogEntry => {
                let record: LogRecord = message.parse_payload()?;
                log_robot_record(&robot_id, &record);
                Ok(None)
            }
            MessageType::LogBatch => {
                let batch: LogBatchPayload = message.parse_payload()?;
                for record in &batch.entries {
                    log_robot_record(&robot_id, record);
                }
                Ok(None)
            }
            MessageType::Error => {
                let report: ErrorPayload = message.parse_payload()?;
                warn!(
                    robot_id = %robot_id,
                    code = report.code.as_deref().unwrap_or("-"),
                    correlation_id = message.correlation_id.as_deref().unwrap_or("-"),
                    "Robot reported error: {}",
                    report.message.as_deref().unwrap_or("")
                );
                Ok(None)
            }
            other => Err(OrchestratorError::Protocol(format!(
                "unhandled message type {}",
                other.as_str()
            ))),
        }
    }

    async fn register(&self, session: &mut RobotSession, message: &Message) -> Result<Message> {
        let registration: RobotRegistration = message.parse_payload()?;
        if registration.robot_id.trim().is_empty() {
            return Err(OrchestratorError::Protocol("'robot_id' is required".to_string()));
        }
        if let Some(previous) = &session.robot_id
            && previous != &registration.robot_id
        {
            return Err(OrchestratorError::Protocol(format!(
                "connection already registered as {}",
                previous
            )));
        }

        let descriptor = self.robots.register(registration, Utc::now()).await;
        self.hub
            .attach(
                &descriptor.robot_id,
                session.connection_id,
                session.outbound.clone(),
            )
            .await;
        session.robot_id = Some(descriptor.robot_id.clone());
        self.robot_online(&descriptor.robot_id);

        let heartbeat_timeout = self.settings.heartbeat_timeout.num_seconds().max(1);
        let mut config = Map::new();
        config.insert("heartbeat_timeout_secs".to_string(), json!(heartbeat_timeout));
        config.insert(
            "heartbeat_interval_secs".to_string(),
            json!((heartbeat_timeout / 3).max(1)),
        );
        config.insert(
            "max_concurrent_jobs".to_string(),
            json!(descriptor.max_concurrent_jobs),
        );
        Ok(MessageBuilder::register_ack(message, true, "registered", config))
    }

    /// Socket closed. The robot stays registered until the heartbeat sweep notices.
    pub async fn connection_closed(&self, session: &RobotSession) {
        if let Some(robot_id) = &session.robot_id
            && self.hub.detach(robot_id, session.connection_id).await
        {
            info!(robot_id = %robot_id, "Robot connection closed");
        }
    }
}
