//! In-memory participant store for tests.

use super::{ParticipantStatus, ParticipantStore, PendingParticipant};
use crate::errors::SignalingError;

use async_trait::async_trait;
use common::types::{FeedId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Record {
    participant: PendingParticipant,
    token: String,
    status: ParticipantStatus,
    feed_id: Option<FeedId>,
}

/// Participant store backed by a map, with the same single-use token rule
/// as the database.
#[derive(Debug, Clone, Default)]
pub struct MemoryParticipantStore {
    records: Arc<Mutex<HashMap<Uuid, Record>>>,
    fail_updates: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryParticipantStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending record and return its ID.
    pub async fn insert_pending(
        &self,
        token: &str,
        room_id: &RoomId,
        user_id: Option<&str>,
        display_name: &str,
    ) -> Uuid {
        let record_id = Uuid::new_v4();
        self.records.lock().await.insert(
            record_id,
            Record {
                participant: PendingParticipant {
                    record_id,
                    room_id: room_id.clone(),
                    user_id: user_id.map(str::to_string),
                    display_name: display_name.to_string(),
                },
                token: token.to_string(),
                status: ParticipantStatus::Pending,
                feed_id: None,
            },
        );
        record_id
    }

    pub async fn status(&self, record_id: Uuid) -> Option<ParticipantStatus> {
        self.records.lock().await.get(&record_id).map(|r| r.status)
    }

    pub async fn feed_id(&self, record_id: Uuid) -> Option<FeedId> {
        self.records
            .lock()
            .await
            .get(&record_id)
            .and_then(|r| r.feed_id.clone())
    }

    /// Make every `update_status` call fail.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ParticipantStore for MemoryParticipantStore {
    async fn consume_join_token(
        &self,
        token: &str,
    ) -> Result<Option<PendingParticipant>, SignalingError> {
        let mut records = self.records.lock().await;
        let record = records
            .values_mut()
            .find(|r| r.token == token && r.status == ParticipantStatus::Pending);

        Ok(record.map(|r| {
            r.status = ParticipantStatus::Joining;
            r.participant.clone()
        }))
    }

    async fn update_status(
        &self,
        record_id: Uuid,
        status: ParticipantStatus,
        feed_id: Option<&FeedId>,
    ) -> Result<(), SignalingError> {
        if self.fail_updates.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SignalingError::Store("update rejected".to_string()));
        }

        if let Some(record) = self.records.lock().await.get_mut(&record_id) {
            record.status = status;
            if let Some(feed_id) = feed_id {
                record.feed_id = Some(feed_id.clone());
            }
        }
        Ok(())
    }
}
