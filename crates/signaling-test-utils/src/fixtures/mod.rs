//! Pre-configured test data fixtures for signaling tests.
//!
//! Provides builders and test data for:
//! - Rooms with static or generated IDs
//! - Participants with join tokens, registered or guest

use common::types::RoomId;
use signaling_service::store::MemoryParticipantStore;
use uuid::Uuid;

/// Test room fixture.
#[derive(Debug, Clone)]
pub struct TestRoom {
    /// Room ID.
    pub id: RoomId,
}

impl TestRoom {
    /// Create a test room with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RoomId::new(id),
        }
    }

    /// Create a test room with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self {
            id: RoomId::generate(),
        }
    }

    /// A participant fixture for this room.
    #[must_use]
    pub fn participant(&self, name: impl Into<String>) -> TestParticipant {
        TestParticipant::new(name).in_room(&self.id)
    }
}

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    /// Single-use join token.
    pub token: String,
    /// Room the token admits to.
    pub room_id: RoomId,
    /// User ID; `None` for guests.
    pub user_id: Option<String>,
    /// Display name.
    pub display_name: String,
}

impl TestParticipant {
    /// Create a registered participant with the given display name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            token: format!("join-{}", Uuid::new_v4().simple()),
            room_id: RoomId::new("9999"),
            user_id: Some(format!("user-{}", Uuid::new_v4())),
            display_name: name.into(),
        }
    }

    /// Create a guest participant (no user ID).
    #[must_use]
    pub fn guest(name: impl Into<String>) -> Self {
        let mut p = Self::new(name);
        p.user_id = None;
        p
    }

    /// Place the participant in a room.
    #[must_use]
    pub fn in_room(mut self, room_id: &RoomId) -> Self {
        self.room_id = room_id.clone();
        self
    }

    /// Set an explicit token (for reproducible tests).
    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = token.to_string();
        self
    }

    /// Insert the pending record and return its ID.
    pub async fn issue(&self, store: &MemoryParticipantStore) -> Uuid {
        store
            .insert_pending(
                &self.token,
                &self.room_id,
                self.user_id.as_deref(),
                &self.display_name,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = TestParticipant::new("alice");
        let b = TestParticipant::new("alice");
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_guest_has_no_user_id() {
        let room = TestRoom::new("R1");
        let guest = TestParticipant::guest("visitor").in_room(&room.id);
        assert!(guest.user_id.is_none());
        assert_eq!(guest.room_id.as_str(), "R1");
    }
}
