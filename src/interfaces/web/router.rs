use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{hooks, jobs, robots, status, triggers};
use super::robot_socket;

fn build_localhost_cors(port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub(crate) fn build_api_router(state: AppState) -> Router {
    // Webhooks authenticate per trigger; robots present their own token on upgrade.
    let public_routes = Router::new()
        .route("/hooks/{trigger_id}", post(hooks::webhook_endpoint))
        .route("/ws/robot", get(robot_socket::robot_ws_handler))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route("/api/status", get(status::get_status))
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/api/jobs/{job_id}", get(jobs::get_job))
        .route("/api/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/api/robots", get(robots::list_robots))
        .route("/api/robots/{robot_id}/pause", post(robots::pause_robot))
        .route("/api/robots/{robot_id}/resume", post(robots::resume_robot))
        .route(
            "/api/triggers",
            get(triggers::list_triggers).post(triggers::create_trigger),
        )
        .route(
            "/api/triggers/{trigger_id}",
            get(triggers::get_trigger).delete(triggers::delete_trigger),
        )
        .route(
            "/api/triggers/{trigger_id}/enable",
            post(triggers::enable_trigger),
        )
        .route(
            "/api/triggers/{trigger_id}/disable",
            post(triggers::disable_trigger),
        )
        .route(
            "/api/triggers/{trigger_id}/fire",
            post(triggers::fire_trigger),
        )
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.ctx.config.server.port))
        .with_state(state);

    public_routes.merge(authed_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    response
}
