use axum::extract::{Path, State};
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, api_error, api_ok};

pub async fn list_robots(State(state): State<AppState>) -> ApiResponse {
    let robots = state.ctx.robots.list().await;
    let mut views = Vec::with_capacity(robots.len());
    for robot in robots {
        let connected = state.ctx.hub.is_connected(&robot.robot_id).await;
        let mut view = json!(robot);
        if let Some(map) = view.as_object_mut() {
            map.insert("connected".to_string(), json!(connected));
        }
        views.push(view);
    }
    api_ok(json!({ "robots": views }))
}

async fn set_paused(state: &AppState, robot_id: &str, paused: bool) -> ApiResponse {
    match state.ctx.engine.set_robot_paused(robot_id, paused).await {
        Ok(()) => match state.ctx.robots.get(robot_id).await {
            Some(robot) => api_ok(json!({ "robot": robot })),
            None => api_ok(json!({})),
        },
        Err(e) => api_error(&e),
    }
}

pub async fn pause_robot(Path(robot_id): Path<String>, State(state): State<AppState>) -> ApiResponse {
    set_paused(&state, &robot_id, true).await
}

pub async fn resume_robot(
    Path(robot_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    set_paused(&state, &robot_id, false).await
}
