//! `GET /ws/robot`: one WebSocket per robot carrying wire-protocol text frames.

use axum::{
    Json,
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use super::auth::token_matches;
use crate::core::dispatch::RobotSession;
use crate::core::protocol::Message;

pub async fn robot_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let expected = state.ctx.config.server.robot_token.as_deref();
    if !token_matches(expected, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "success": false, "error": "Invalid robot token" })),
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let engine = state.ctx.engine.clone();
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let mut session = RobotSession::new(engine.hub().next_connection_id(), out_tx.clone());
    debug!(connection = session.connection_id, "Robot socket opened");

    // Everything addressed to this robot, replies and pushes alike, leaves through here.
    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let frame = match message.to_wire() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable outbound message");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text.as_str().to_string(),
            Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(connection = session.connection_id, "Ignoring non UTF-8 binary frame");
                    continue;
                }
            },
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                warn!(connection = session.connection_id, error = %e, "Robot socket error");
                break;
            }
        };

        if let Some(reply) = engine.handle_frame(&mut session, &text).await
            && out_tx.send(reply).is_err()
        {
            break;
        }
    }

    engine.connection_closed(&session).await;
    drop(session);
    drop(out_tx);
    send_task.abort();
    info!("Robot socket closed");
}
