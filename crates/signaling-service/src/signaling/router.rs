//! Signaling HTTP surface: `GET /ws?token=...` upgrades to the signaling
//! WebSocket.
//!
//! The upgrade always completes. A refused connection is then closed with
//! the reserved close code (4001 missing token, 4002 invalid token).

use super::connection::{admit, ConnectionActor, INBOUND_BUFFER};
use crate::errors::SignalingError;
use crate::gateway::GatewayConnectionManager;
use crate::observability::metrics;
use crate::registry::{ConnectionHandle, Registry, OUTBOUND_BUFFER};
use crate::store::{AiQueryDispatcher, ChatContextStore, ParticipantStore, RoomStateHook};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Shared state of the signaling endpoint.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub gateway: GatewayConnectionManager,
    pub store: Arc<dyn ParticipantStore>,
    /// Released when a room empties (chat context).
    pub room_state: Arc<dyn RoomStateHook>,
    pub ai: Arc<dyn AiQueryDispatcher>,
    /// Per-room chat history fed by `send-message` and `ai-query`.
    pub chat_context: Arc<ChatContextStore>,
    /// Cancelling this closes every signaling connection.
    pub shutdown: CancellationToken,
    /// Upgraded connection tasks; wait on it after `shutdown` to let every
    /// connection finish its teardown.
    pub connections: TaskTracker,
}

/// Query parameters of the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// Build the signaling router.
pub fn signaling_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let connections = state.connections.clone();
    ws.on_upgrade(move |socket| {
        connections.track_future(handle_socket(socket, state, params.token))
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let pending = match admit(&state, token.as_deref()).await {
        Ok(pending) => pending,
        Err(e) => {
            reject(socket, &e).await;
            return;
        }
    };

    metrics::connection_opened();
    info!(
        target: "signal.connection",
        room_id = %pending.room_id,
        "Join token accepted"
    );

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
    let closed = state.shutdown.child_token();
    let connection = ConnectionHandle::new(outbound_tx, closed.clone());

    let (participant_id, actor) =
        ConnectionActor::spawn(state, pending, connection, inbound_rx, closed.clone());

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },

                () = writer_closed.cancelled() => {
                    // Flush what the actor queued before it finished
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            () = closed.cancelled() => break,

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if inbound_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(
                        target: "signal.connection",
                        participant_id = %participant_id,
                        error = %e,
                        "WebSocket read failed"
                    );
                    break;
                }
            }
        }
    }

    drop(inbound_tx);
    if let Err(e) = actor.await {
        error!(
            target: "signal.connection",
            participant_id = %participant_id,
            error = %e,
            "Connection actor panicked"
        );
        closed.cancel();
    }
    let _ = writer.await;

    metrics::connection_closed();
}

/// Close a refused connection with its reserved code.
async fn reject(mut socket: WebSocket, error: &SignalingError) {
    let (code, reason) = match error.close_code() {
        Some(code) => (code, error.client_message()),
        None => (close_code::ERROR, "Internal error".to_string()),
    };

    let label = match error {
        SignalingError::MissingJoinToken => "missing_token",
        SignalingError::InvalidJoinToken => "invalid_token",
        _ => "store_error",
    };
    metrics::record_connection_rejected(label);

    warn!(
        target: "signal.connection",
        close_code = code,
        error = %error,
        "Connection refused"
    );

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason),
        })))
        .await;
}
