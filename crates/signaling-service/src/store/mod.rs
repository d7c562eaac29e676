//! External collaborators of the signaling router.
//!
//! - [`ParticipantStore`]: single-use join tokens and durable participant status
//! - [`RoomStateHook`]: release of ephemeral per-room state when a room empties
//! - [`AiQueryDispatcher`]: hand-off point for `ai-query` messages

pub mod ai;
pub mod chat_context;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod pg;

pub use ai::{AiQueryDispatcher, DisabledAiDispatcher};
pub use chat_context::{ChatContextStore, ChatMessage, ChatRole, MAX_CONTEXT_MESSAGES};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryParticipantStore;
pub use pg::PgParticipantStore;

use crate::errors::SignalingError;

use async_trait::async_trait;
use common::types::{FeedId, RoomId};
use uuid::Uuid;

/// Lifecycle of a participant record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    /// Created by the REST layer, token not yet used.
    Pending,
    /// Token consumed by a signaling connection.
    Joining,
    /// Publisher joined; the feed ID is recorded.
    Active,
    Left,
}

impl ParticipantStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantStatus::Pending => "pending",
            ParticipantStatus::Joining => "joining",
            ParticipantStatus::Active => "active",
            ParticipantStatus::Left => "left",
        }
    }
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant record admitted by a join token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingParticipant {
    pub record_id: Uuid,
    pub room_id: RoomId,
    /// `None` for guests.
    pub user_id: Option<String>,
    pub display_name: String,
}

/// Durable participant records owned by the REST layer.
#[async_trait]
pub trait ParticipantStore: Send + Sync {
    /// Consume a join token.
    ///
    /// Returns `None` if the token is unknown or was already used. A token
    /// is accepted at most once, even under concurrent connections.
    async fn consume_join_token(
        &self,
        token: &str,
    ) -> Result<Option<PendingParticipant>, SignalingError>;

    /// Record a status change (and the feed ID once known).
    async fn update_status(
        &self,
        record_id: Uuid,
        status: ParticipantStatus,
        feed_id: Option<&FeedId>,
    ) -> Result<(), SignalingError>;
}

/// Owner of ephemeral per-room state.
#[async_trait]
pub trait RoomStateHook: Send + Sync {
    /// Called once the last participant has left `room_id`.
    async fn clear_room(&self, room_id: &RoomId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_match_stored_values() {
        assert_eq!(ParticipantStatus::Pending.as_str(), "pending");
        assert_eq!(ParticipantStatus::Joining.as_str(), "joining");
        assert_eq!(ParticipantStatus::Active.to_string(), "active");
        assert_eq!(ParticipantStatus::Left.to_string(), "left");
    }
}
