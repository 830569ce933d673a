use axum::extract::State;
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, api_error, api_ok};

pub async fn get_status(State(state): State<AppState>) -> ApiResponse {
    match state.ctx.status().await {
        Ok(report) => api_ok(json!({ "status": report })),
        Err(e) => api_error(&e),
    }
}
