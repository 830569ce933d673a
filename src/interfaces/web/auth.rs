use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;
use crate::core::triggers::webhook::constant_time_eq;

pub(crate) fn is_loopback(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Whether `headers` carry `expected` as a bearer token. No expected token means open.
pub(crate) fn token_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    match expected {
        None => true,
        Some(expected) => bearer_token(headers)
            .is_some_and(|t| constant_time_eq(t.as_bytes(), expected.as_bytes())),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let server = &state.ctx.config.server;

    // No token configured: open on loopback only (safe for local use).
    let Some(expected) = server.api_token.as_deref() else {
        if is_loopback(&server.host) {
            return next.run(req).await;
        }
        return unauthorized(
            "No api_token configured. Set [server] api_token before exposing the API on a non-loopback address.",
        );
    };

    if bearer_token(req.headers()).is_none() {
        return unauthorized("Missing or invalid Authorization header. Use: Bearer <token>");
    }
    if token_matches(Some(expected), req.headers()) {
        next.run(req).await
    } else {
        unauthorized("Invalid API token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::OrchestratorConfig;
    use crate::core::context::OrchestratorContext;
    use crate::core::storage::Storage;
    use axum::{Router, middleware, routing::get};
    use serde_json::json;
    use tower::util::ServiceExt;

    async fn test_state(host: &str, token: Option<&str>) -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.server.host = host.to_string();
        config.server.api_token = token.map(|t| t.to_string());
        config.triggers.workflows_dir = dir.path().to_path_buf();
        let ctx = OrchestratorContext::with_storage(config, Storage::open_in_memory().unwrap())
            .await
            .unwrap();
        let (log_tx, _) = tokio::sync::broadcast::channel(8);
        AppState { ctx, log_tx }
    }

    fn protected_app(state: AppState) -> Router {
        Router::new()
            .route(
                "/api/ping",
                get(|| async { axum::Json(json!({ "ok": true })).into_response() }),
            )
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::require_auth,
            ))
            .with_state(state)
    }

    async fn ping_status(app: Router, authorization: Option<&str>) -> StatusCode {
        let mut builder = Request::builder().uri("/api/ping");
        if let Some(value) = authorization {
            builder = builder.header("authorization", value);
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn no_token_on_loopback_allows_request() {
        let app = protected_app(test_state("127.0.0.1", None).await);
        assert_eq!(ping_status(app, None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn no_token_on_wildcard_bind_rejects_request() {
        let app = protected_app(test_state("0.0.0.0", None).await);
        assert_eq!(ping_status(app, None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn configured_token_is_required_and_checked() {
        let state = test_state("127.0.0.1", Some("s3cret")).await;
        assert_eq!(
            ping_status(protected_app(state.clone()), None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ping_status(protected_app(state.clone()), Some("Bearer nope")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ping_status(protected_app(state), Some("Bearer s3cret")).await,
            StatusCode::OK
        );
    }

    #[test]
    fn robot_token_check_is_open_when_unset() {
        let mut headers = HeaderMap::new();
        assert!(token_matches(None, &headers));
        assert!(!token_matches(Some("t"), &headers));
        headers.insert("authorization", "Bearer t".parse().unwrap());
        assert!(token_matches(Some("t"), &headers));
    }
}
