pub mod hooks;
pub mod jobs;
pub mod robots;
pub mod status;
pub mod triggers;

use axum::{Json, http::StatusCode};
use serde_json::{Value, json};

use crate::core::errors::OrchestratorError;

/// Status code plus the `{"success": .., ...}` body every endpoint returns.
pub type ApiResponse = (StatusCode, Json<Value>);

pub(crate) fn status_for(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::Authentication(_) => StatusCode::UNAUTHORIZED,
        OrchestratorError::Configuration(_) | OrchestratorError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn api_error(e: &OrchestratorError) -> ApiResponse {
    (
        status_for(e),
        Json(json!({
            "success": false,
            "error": e.to_string(),
            "error_type": e.error_type(),
        })),
    )
}

/// Merges `fields` into a successful response body.
pub(crate) fn api_ok(fields: Value) -> ApiResponse {
    let mut body = json!({ "success": true });
    if let (Some(body), Value::Object(fields)) = (body.as_object_mut(), fields) {
        body.extend(fields);
    }
    (StatusCode::OK, Json(body))
}
