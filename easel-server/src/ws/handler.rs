use std::fmt::Display;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use easel_core::dto::ws::{ClientCommand, ClientFrame, ServerFrame};
use futures::{SinkExt, Stream, StreamExt};

use crate::api::AppState;
use crate::ws::manager::{ConnectionId, ConnectionManager};

/// HTTP handler that upgrades the connection to WebSocket.
///
/// After the upgrade the connection is registered with `ConnectionManager`
/// and managed by a sender task plus the receive loop.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.connections))
}

async fn handle_socket(socket: WebSocket, manager: Arc<ConnectionManager>) {
    let (conn_id, mut rx) = manager.add().await;
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    let (mut sink, stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    run_connection(&manager, conn_id, stream).await;

    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Processes inbound frames for one registered connection until it closes.
///
/// Always unsubscribes and removes the connection before returning.
pub async fn run_connection<S, E>(manager: &ConnectionManager, conn_id: ConnectionId, mut stream: S)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => handle_text(manager, conn_id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    manager.remove(conn_id).await;
}

async fn handle_text(manager: &ConnectionManager, conn_id: ConnectionId, text: &str) {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(conn_id = %conn_id, error = %e, "Ignoring malformed frame");
            return;
        }
    };

    for command in frame.commands() {
        match command {
            Ok(ClientCommand::Subscribe(job_id)) => {
                if !manager.subscribe(conn_id, job_id).await {
                    continue;
                }
                tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Subscribed");
                manager
                    .send_to(conn_id, &ServerFrame::Subscribed(job_id))
                    .await;
            }
            Err(e) => {
                tracing::info!(conn_id = %conn_id, error = %e, "Ignoring command");
            }
        }
    }
}
