use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::info;

use super::super::AppState;
use super::{ApiResponse, api_error, api_ok};
use crate::core::bridge::SubmitRequest;
use crate::core::dispatch::DispatchEngine;
use crate::core::errors::OrchestratorError;
use crate::core::job::{Job, JobStatus};
use crate::core::queue::JobListFilter;

const DEFAULT_LIST_LIMIT: usize = 100;

/// The job as stored, plus why it is (or is not) progressing.
async fn job_view(engine: &DispatchEngine, job: &Job) -> Value {
    let explanation = engine.explain(job, Utc::now()).await;
    let mut value = serde_json::to_value(job).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        // Workflow bodies can be large; fetch a single job to see it.
        map.remove("workflow_payload");
        map.insert("explanation".to_string(), json!(explanation));
    }
    value
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResponse {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match JobStatus::from_status(raw) {
            Some(status) => Some(status),
            None => {
                return api_error(&OrchestratorError::Validation(format!(
                    "unknown job status '{}'",
                    raw
                )));
            }
        },
    };
    let filter = JobListFilter {
        status,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
    };
    match state.ctx.queue.list(&filter).await {
        Ok(jobs) => {
            let mut views = Vec::with_capacity(jobs.len());
            for job in &jobs {
                views.push(job_view(&state.ctx.engine, job).await);
            }
            api_ok(json!({ "jobs": views }))
        }
        Err(e) => api_error(&e),
    }
}

pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> ApiResponse {
    match state.ctx.bridge.submit(request).await {
        Ok(job) => {
            info!(job_id = %job.job_id, workflow_id = %job.workflow_id, "Job submitted via API");
            api_ok(json!({ "job": job_view(&state.ctx.engine, &job).await }))
        }
        Err(e) => api_error(&e),
    }
}

pub async fn get_job(Path(job_id): Path<String>, State(state): State<AppState>) -> ApiResponse {
    match state.ctx.queue.get(&job_id).await {
        Ok(Some(job)) => {
            let mut view = job_view(&state.ctx.engine, &job).await;
            if let Some(map) = view.as_object_mut()
                && !job.workflow_payload.is_empty()
            {
                map.insert("workflow_payload".to_string(), json!(job.workflow_payload));
            }
            api_ok(json!({ "job": view }))
        }
        Ok(None) => api_error(&OrchestratorError::NotFound(format!("job {}", job_id))),
        Err(e) => api_error(&e),
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub async fn cancel_job(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<CancelRequest>>,
) -> ApiResponse {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "cancelled by operator".to_string());
    match state.ctx.engine.cancel(&job_id, &reason, Utc::now()).await {
        Ok(job) => api_ok(json!({ "job": job_view(&state.ctx.engine, &job).await })),
        Err(e) => api_error(&e),
    }
}
