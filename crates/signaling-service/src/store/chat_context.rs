//! Per-room chat history used as conversational context for the assistant.

use super::RoomStateHook;

use async_trait::async_trait;
use common::types::RoomId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Messages kept per room; the oldest are dropped first.
pub const MAX_CONTEXT_MESSAGES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Bounded chat history keyed by room.
#[derive(Debug, Default)]
pub struct ChatContextStore {
    contexts: Mutex<HashMap<RoomId, VecDeque<ChatMessage>>>,
}

impl ChatContextStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// History of a room, oldest first. Empty for unknown rooms.
    pub async fn get_context(&self, room_id: &RoomId) -> Vec<ChatMessage> {
        self.contexts
            .lock()
            .await
            .get(room_id)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn add_message(&self, room_id: &RoomId, role: ChatRole, content: impl Into<String>) {
        let mut contexts = self.contexts.lock().await;
        let messages = contexts.entry(room_id.clone()).or_default();

        messages.push_back(ChatMessage {
            role,
            content: content.into(),
        });
        while messages.len() > MAX_CONTEXT_MESSAGES {
            messages.pop_front();
        }

        debug!(
            target: "signal.store",
            room_id = %room_id,
            length = messages.len(),
            "Chat context message added"
        );
    }

    pub async fn room_count(&self) -> usize {
        self.contexts.lock().await.len()
    }
}

#[async_trait]
impl RoomStateHook for ChatContextStore {
    async fn clear_room(&self, room_id: &RoomId) {
        if self.contexts.lock().await.remove(room_id).is_some() {
            info!(target: "signal.store", room_id = %room_id, "Chat context cleared");
        }
    }
}
