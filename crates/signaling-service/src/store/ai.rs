//! Hand-off point for `ai-query` messages.

use crate::registry::ConnectionHandle;
use crate::signaling::protocol::ServerMessage;

use async_trait::async_trait;
use common::types::{ParticipantId, RoomId};
use tracing::debug;

/// Code sent when no assistant is configured.
pub const AI_UNAVAILABLE: &str = "AI_UNAVAILABLE";

/// Receives assistant queries. Implementations reply on `reply` and must
/// not block the caller; long work belongs on a spawned task.
#[async_trait]
pub trait AiQueryDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        query: String,
        reply: ConnectionHandle,
    );
}

/// Dispatcher used when no assistant is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAiDispatcher;

#[async_trait]
impl AiQueryDispatcher for DisabledAiDispatcher {
    async fn dispatch(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        _query: String,
        reply: ConnectionHandle,
    ) {
        debug!(
            target: "signal.store",
            room_id = %room_id,
            participant_id = %participant_id,
            "AI query rejected, assistant disabled"
        );
        reply.send(&ServerMessage::AiError {
            code: AI_UNAVAILABLE.to_string(),
            message: Some("AI assistant is not enabled".to_string()),
        });
    }
}
