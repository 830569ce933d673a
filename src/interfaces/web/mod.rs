pub(crate) mod auth;
mod handlers;
mod robot_socket;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::context::OrchestratorContext;
use crate::core::lifecycle::LifecycleComponent;

/// Operator API, webhook receiver and robot WebSocket on one listener.
pub struct ApiServer {
    ctx: OrchestratorContext,
    log_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ctx: OrchestratorContext,
    pub(crate) log_tx: broadcast::Sender<String>,
}

impl ApiServer {
    pub fn new(
        ctx: OrchestratorContext,
        log_tx: broadcast::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            log_tx,
            cancel: cancel.child_token(),
            handle: None,
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().event("lagged").data("Log stream lagged")),
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- Lifecycle Implementation ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let server = &self.ctx.config.server;
        let addr = format!("{}:{}", server.host, server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind API server to {}", addr))?;
        if server.api_token.is_none() && !auth::is_loopback(&server.host) {
            tracing::warn!(
                host = %server.host,
                "No api_token configured; /api is refused for non-loopback binds"
            );
        }

        let state = AppState {
            ctx: self.ctx.clone(),
            log_tx: self.log_tx.clone(),
        };
        let app = router::build_api_router(state);
        let cancel = self.cancel.clone();

        self.handle = Some(tokio::spawn(async move {
            info!("API server running at http://{addr}");
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("API server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}
