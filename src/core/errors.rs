use thiserror::Error;

use crate::core::job::JobStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No eligible robot for job {0}")]
    NoCapacity(String),

    #[error("Robot timeout: {0}")]
    RobotTimeout(String),

    #[error("Queue backend error: {0}")]
    QueueBackend(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),
}

impl OrchestratorError {
    /// Stable name recorded in job history and `ERROR` messages.
    pub fn error_type(&self) -> &'static str {
        match self {
            OrchestratorError::Authentication(_) => "AuthenticationError",
            OrchestratorError::Configuration(_) => "ConfigurationError",
            OrchestratorError::NoCapacity(_) => "NoCapacityError",
            OrchestratorError::RobotTimeout(_) => "RobotTimeoutError",
            OrchestratorError::QueueBackend(_) => "QueueBackendError",
            OrchestratorError::Protocol(_) => "ProtocolError",
            OrchestratorError::InvalidTransition { .. } => "InvalidTransitionError",
            OrchestratorError::NotFound(_) => "NotFoundError",
            OrchestratorError::Validation(_) => "ValidationError",
        }
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        OrchestratorError::QueueBackend(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_types_are_stable_names() {
        assert_eq!(
            OrchestratorError::Authentication("x".into()).error_type(),
            "AuthenticationError"
        );
        assert_eq!(
            OrchestratorError::QueueBackend("x".into()).error_type(),
            "QueueBackendError"
        );
        assert_eq!(
            OrchestratorError::Protocol("x".into()).error_type(),
            "ProtocolError"
        );
    }

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = OrchestratorError::InvalidTransition {
            job_id: "j1".into(),
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Illegal transition for job j1: completed -> running"
        );
    }
}
