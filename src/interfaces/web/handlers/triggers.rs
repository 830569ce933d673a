use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Map, Value, json};

use super::super::AppState;
use super::{ApiResponse, api_error, api_ok};
use crate::core::errors::OrchestratorError;
use crate::core::triggers::{EmitOutcome, TriggerConfig};

/// JSON shape shared by manual fires and webhook deliveries.
pub(crate) fn outcome_json(outcome: &EmitOutcome) -> Value {
    match outcome {
        EmitOutcome::Submitted(job_id) => json!({ "outcome": "submitted", "job_id": job_id }),
        EmitOutcome::Suppressed { retry_after } => json!({
            "outcome": "suppressed",
            "retry_after_ms": retry_after.as_millis() as u64,
        }),
        EmitOutcome::Failed(reason) => json!({ "outcome": "failed", "reason": reason }),
    }
}

pub async fn list_triggers(State(state): State<AppState>) -> ApiResponse {
    let triggers = state.ctx.triggers.list().await;
    api_ok(json!({ "triggers": triggers }))
}

pub async fn create_trigger(
    State(state): State<AppState>,
    Json(config): Json<TriggerConfig>,
) -> ApiResponse {
    match state.ctx.triggers.add(config).await {
        Ok(view) => api_ok(json!({ "trigger": view })),
        Err(e) => api_error(&e),
    }
}

pub async fn get_trigger(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.ctx.triggers.get(&trigger_id).await {
        Some(view) => api_ok(json!({ "trigger": view })),
        None => api_error(&OrchestratorError::NotFound(format!("trigger {}", trigger_id))),
    }
}

pub async fn delete_trigger(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.ctx.triggers.remove(&trigger_id).await {
        Ok(true) => api_ok(json!({ "message": "Trigger removed" })),
        Ok(false) => api_error(&OrchestratorError::NotFound(format!("trigger {}", trigger_id))),
        Err(e) => api_error(&e),
    }
}

async fn set_enabled(state: &AppState, trigger_id: &str, enabled: bool) -> ApiResponse {
    match state.ctx.triggers.set_enabled(trigger_id, enabled).await {
        Ok(view) => api_ok(json!({ "trigger": view })),
        Err(e) => api_error(&e),
    }
}

pub async fn enable_trigger(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    set_enabled(&state, &trigger_id, true).await
}

pub async fn disable_trigger(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    set_enabled(&state, &trigger_id, false).await
}

pub async fn fire_trigger(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<Map<String, Value>>>,
) -> ApiResponse {
    let payload = body.map(|Json(p)| p).unwrap_or_default();
    match state.ctx.triggers.fire(&trigger_id, payload).await {
        Ok(outcome) => api_ok(outcome_json(&outcome)),
        Err(e) => api_error(&e),
    }
}
