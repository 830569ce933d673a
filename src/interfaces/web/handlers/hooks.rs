use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use tracing::warn;

use super::super::AppState;
use super::triggers::outcome_json;
use super::{ApiResponse, api_error, api_ok};
use crate::core::triggers::EmitOutcome;

/// Public webhook receiver. Auth is per trigger, checked against the raw body bytes.
pub async fn webhook_endpoint(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    match state
        .ctx
        .triggers
        .handle_webhook(&trigger_id, &headers, &body)
        .await
    {
        Ok(outcome) => {
            let (status, body) = api_ok(outcome_json(&outcome));
            match outcome {
                EmitOutcome::Submitted(_) => (StatusCode::ACCEPTED, body),
                EmitOutcome::Suppressed { .. } => (StatusCode::TOO_MANY_REQUESTS, body),
                EmitOutcome::Failed(_) => (status, body),
            }
        }
        Err(e) => {
            warn!(trigger_id = %trigger_id, error_type = e.error_type(), error = %e, "Webhook rejected");
            api_error(&e)
        }
    }
}
