//! Session/Room Registry.
//!
//! In-memory bookkeeping of rooms, their participants, and each
//! participant's media sessions. All mutation happens under one write lock,
//! so "last participant leaves" and "room is removed" are a single step.
//! Subscriber teardown runs after the lock is released.

use crate::observability::metrics;
use crate::sessions::{PublisherSession, SubscriberSession};

use common::types::{FeedId, ParticipantId, RoomId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of a connection's outbound frame channel.
pub const OUTBOUND_BUFFER: usize = 256;

/// Outbound side of one signaling connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(sender: mpsc::Sender<String>, closed: CancellationToken) -> Self {
        Self { sender, closed }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Queue a serialized frame. Returns false if the frame was dropped.
    pub fn send_raw(&self, frame: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.sender.try_send(frame).is_ok()
    }

    /// Serialize and queue a message. Returns false if it was dropped.
    pub fn send<M: Serialize>(&self, message: &M) -> bool {
        match serde_json::to_string(message) {
            Ok(frame) => self.send_raw(frame),
            Err(e) => {
                warn!(target: "signal.registry", error = %e, "Outbound message encode failed");
                false
            }
        }
    }
}

/// Durable identity of a participant, owned by the participant store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Store record this participant was admitted with.
    #[serde(skip)]
    pub record_id: uuid::Uuid,
    pub user_id: Option<String>,
    pub display_name: String,
}

/// A registered participant.
pub struct Participant {
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub connection: ConnectionHandle,
    pub publisher: Arc<PublisherSession>,
    pub info: ParticipantInfo,
    subscribers: HashMap<FeedId, Arc<SubscriberSession>>,
    feed_id: Option<FeedId>,
}

impl Participant {
    #[must_use]
    pub fn new(
        participant_id: ParticipantId,
        room_id: RoomId,
        connection: ConnectionHandle,
        publisher: Arc<PublisherSession>,
        info: ParticipantInfo,
    ) -> Self {
        Self {
            participant_id,
            room_id,
            connection,
            publisher,
            info,
            subscribers: HashMap::new(),
            feed_id: None,
        }
    }

    fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            participant_id: self.participant_id,
            room_id: self.room_id.clone(),
            connection: self.connection.clone(),
            publisher: Arc::clone(&self.publisher),
            info: self.info.clone(),
            feed_id: self.feed_id.clone(),
            subscriber_count: self.subscribers.len(),
        }
    }
}

/// Point-in-time view of a participant.
#[derive(Clone)]
pub struct ParticipantSnapshot {
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub connection: ConnectionHandle,
    pub publisher: Arc<PublisherSession>,
    pub info: ParticipantInfo,
    pub feed_id: Option<FeedId>,
    pub subscriber_count: usize,
}

/// What [`Registry::remove_participant`] removed.
#[derive(Debug, Clone)]
pub struct RemovedParticipant {
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub info: ParticipantInfo,
    pub feed_id: Option<FeedId>,
    pub room_now_empty: bool,
}

/// Outcome of [`Registry::set_feed_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedAssignment {
    /// First assignment.
    Assigned,
    /// A feed ID was already set; carries the existing value.
    AlreadySet(FeedId),
    UnknownParticipant,
}

type Rooms = HashMap<RoomId, HashMap<ParticipantId, Participant>>;

/// Registry of rooms and participants.
#[derive(Clone, Default)]
pub struct Registry {
    rooms: Arc<RwLock<Rooms>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant, creating its room on first join.
    pub async fn add_participant(&self, participant: Participant) {
        let room_id = participant.room_id.clone();
        let participant_id = participant.participant_id;

        let room_count = {
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(room_id.clone())
                .or_default()
                .insert(participant_id, participant);
            rooms.len()
        };

        metrics::set_rooms_active(room_count);
        info!(
            target: "signal.registry",
            room_id = %room_id,
            participant_id = %participant_id,
            "Participant added"
        );
    }

    /// Remove a participant, dropping the room if it is now empty, then
    /// destroy the participant's subscriber sessions.
    pub async fn remove_participant(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
    ) -> Option<RemovedParticipant> {
        let (participant, room_now_empty, room_count) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms.get_mut(room_id)?;
            let participant = room.remove(&participant_id)?;
            let room_now_empty = room.is_empty();
            if room_now_empty {
                rooms.remove(room_id);
            }
            (participant, room_now_empty, rooms.len())
        };

        for subscriber in participant.subscribers.values() {
            subscriber.destroy().await;
        }

        metrics::set_rooms_active(room_count);
        info!(
            target: "signal.registry",
            room_id = %room_id,
            participant_id = %participant_id,
            room_now_empty = room_now_empty,
            "Participant removed"
        );

        Some(RemovedParticipant {
            participant_id,
            room_id: room_id.clone(),
            info: participant.info,
            feed_id: participant.feed_id,
            room_now_empty,
        })
    }

    pub async fn get_participant(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
    ) -> Option<ParticipantSnapshot> {
        self.rooms
            .read()
            .await
            .get(room_id)?
            .get(&participant_id)
            .map(Participant::snapshot)
    }

    pub async fn list_participants(&self, room_id: &RoomId) -> Vec<ParticipantSnapshot> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.values().map(Participant::snapshot).collect())
            .unwrap_or_default()
    }

    /// Set a participant's feed ID. Only the first call assigns.
    pub async fn set_feed_id(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        feed_id: FeedId,
    ) -> FeedAssignment {
        let mut rooms = self.rooms.write().await;
        let Some(participant) = rooms
            .get_mut(room_id)
            .and_then(|room| room.get_mut(&participant_id))
        else {
            return FeedAssignment::UnknownParticipant;
        };

        match &participant.feed_id {
            Some(existing) => FeedAssignment::AlreadySet(existing.clone()),
            None => {
                debug!(
                    target: "signal.registry",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    feed_id = %feed_id,
                    "Feed ID assigned"
                );
                participant.feed_id = Some(feed_id);
                FeedAssignment::Assigned
            }
        }
    }

    /// Whether some registered participant of the room owns `feed_id`.
    pub async fn has_feed(&self, room_id: &RoomId, feed_id: &FeedId) -> bool {
        self.rooms.read().await.get(room_id).is_some_and(|room| {
            room.values()
                .any(|participant| participant.feed_id.as_ref() == Some(feed_id))
        })
    }

    /// Register a subscriber session, destroying any it replaces.
    ///
    /// Returns false (and destroys `subscriber`) if the participant is gone.
    pub async fn add_subscriber(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        subscriber: Arc<SubscriberSession>,
    ) -> bool {
        let outcome = {
            let mut rooms = self.rooms.write().await;
            match rooms
                .get_mut(room_id)
                .and_then(|room| room.get_mut(&participant_id))
            {
                Some(participant) => Ok(participant
                    .subscribers
                    .insert(subscriber.feed_id().clone(), Arc::clone(&subscriber))),
                None => Err(()),
            }
        };

        match outcome {
            Ok(replaced) => {
                if let Some(replaced) = replaced {
                    replaced.destroy().await;
                }
                true
            }
            Err(()) => {
                subscriber.destroy().await;
                false
            }
        }
    }

    pub async fn get_subscriber(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        feed_id: &FeedId,
    ) -> Option<Arc<SubscriberSession>> {
        self.rooms
            .read()
            .await
            .get(room_id)?
            .get(&participant_id)?
            .subscribers
            .get(feed_id)
            .cloned()
    }

    /// Remove and destroy a subscriber session. Returns false if absent.
    pub async fn remove_subscriber(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        feed_id: &FeedId,
    ) -> bool {
        let removed = {
            let mut rooms = self.rooms.write().await;
            rooms
                .get_mut(room_id)
                .and_then(|room| room.get_mut(&participant_id))
                .and_then(|participant| participant.subscribers.remove(feed_id))
        };

        match removed {
            Some(subscriber) => {
                subscriber.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Serialize `message` once and queue it on every open connection in the
    /// room except `exclude`. Closed connections are skipped. Returns the
    /// number of connections the message was queued on.
    pub async fn broadcast<M: Serialize>(
        &self,
        room_id: &RoomId,
        message: &M,
        exclude: Option<ParticipantId>,
    ) -> usize {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "signal.registry", error = %e, "Broadcast encode failed");
                return 0;
            }
        };

        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(room_id) else {
            return 0;
        };

        room.values()
            .filter(|participant| Some(participant.participant_id) != exclude)
            .filter(|participant| participant.connection.send_raw(frame.clone()))
            .count()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn participant_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sessions::{SessionEvent, SubscriberState};
    use common::types::PrivateId;
    use serde_json::json;

    struct TestConnection {
        id: ParticipantId,
        frames: mpsc::Receiver<String>,
        closed: CancellationToken,
    }

    fn participant(room: &RoomId, name: &str) -> (Participant, TestConnection) {
        let id = ParticipantId::new();
        let (tx, frames) = mpsc::channel(OUTBOUND_BUFFER);
        let closed = CancellationToken::new();
        let (events, _) = mpsc::channel::<SessionEvent>(1);

        let publisher = Arc::new(PublisherSession::new(
            id,
            room.clone(),
            name.to_string(),
            PrivateId::generate(),
            true,
            events,
        ));
        let info = ParticipantInfo {
            record_id: uuid::Uuid::new_v4(),
            user_id: Some(format!("user-{name}")),
            display_name: name.to_string(),
        };

        (
            Participant::new(
                id,
                room.clone(),
                ConnectionHandle::new(tx, closed.clone()),
                publisher,
                info,
            ),
            TestConnection { id, frames, closed },
        )
    }

    fn subscriber(participant_id: ParticipantId, room: &RoomId, feed: u64) -> Arc<SubscriberSession> {
        let (events, _) = mpsc::channel(1);
        Arc::new(SubscriberSession::new(
            participant_id,
            room.clone(),
            FeedId::Numeric(feed),
            PrivateId::generate(),
            true,
            events,
        ))
    }

    #[tokio::test]
    async fn test_room_removed_when_last_participant_leaves() {
        let registry = Registry::new();
        let room = RoomId::new("R1");
        let (a, conn_a) = participant(&room, "a");
        let (b, conn_b) = participant(&room, "b");
        registry.add_participant(a).await;
        registry.add_participant(b).await;
        assert_eq!(registry.room_count().await, 1);

        let removed = registry.remove_participant(&room, conn_a.id).await.unwrap();
        assert!(!removed.room_now_empty);
        assert_eq!(registry.participant_count(&room).await, 1);

        let removed = registry.remove_participant(&room, conn_b.id).await.unwrap();
        assert!(removed.room_now_empty);
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.list_participants(&room).await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_participant_is_none() {
        let registry = Registry::new();
        let room = RoomId::new("R1");
        assert!(registry
            .remove_participant(&room, ParticipantId::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_skips_closed() {
        let registry = Registry::new();
        let room = RoomId::new("R1");
        let (a, mut conn_a) = participant(&room, "a");
        let (b, mut conn_b) = participant(&room, "b");
        let (c, mut conn_c) = participant(&room, "c");
        registry.add_participant(a).await;
        registry.add_participant(b).await;
        registry.add_participant(c).await;

        conn_c.closed.cancel();

        let delivered = registry
            .broadcast(&room, &json!({"type": "ping"}), Some(conn_a.id))
            .await;
        assert_eq!(delivered, 1);

        assert_eq!(conn_b.frames.try_recv().unwrap(), r#"{"type":"ping"}"#);
        assert!(conn_a.frames.try_recv().is_err());
        assert!(conn_c.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_missing_room_delivers_nothing() {
        let registry = Registry::new();
        let delivered = registry
            .broadcast(&RoomId::new("nowhere"), &json!({"type": "ping"}), None)
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_feed_id_is_set_once() {
        let registry = Registry::new();
        let room = RoomId::new("R1");
        let (a, conn_a) = participant(&room, "a");
        registry.add_participant(a).await;

        assert_eq!(
            registry
                .set_feed_id(&room, conn_a.id, FeedId::Numeric(7))
                .await,
            FeedAssignment::Assigned
        );
        assert_eq!(
            registry
                .set_feed_id(&room, conn_a.id, FeedId::Numeric(8))
                .await,
            FeedAssignment::AlreadySet(FeedId::Numeric(7))
        );
        assert!(registry.has_feed(&room, &FeedId::Numeric(7)).await);
        assert!(!registry.has_feed(&room, &FeedId::Numeric(8)).await);

        assert_eq!(
            registry
                .set_feed_id(&room, ParticipantId::new(), FeedId::Numeric(9))
                .await,
            FeedAssignment::UnknownParticipant
        );
    }

    #[tokio::test]
    async fn test_replacing_subscriber_destroys_previous() {
        let registry = Registry::new();
        let room = RoomId::new("R1");
        let (a, conn_a) = participant(&room, "a");
        registry.add_participant(a).await;

        let first = subscriber(conn_a.id, &room, 5);
        let second = subscriber(conn_a.id, &room, 5);
        assert!(registry.add_subscriber(&room, conn_a.id, Arc::clone(&first)).await);
        assert!(registry.add_subscriber(&room, conn_a.id, Arc::clone(&second)).await);

        assert_eq!(first.state().await, SubscriberState::TornDown);
        assert_eq!(second.state().await, SubscriberState::Detached);

        let found = registry
            .get_subscriber(&room, conn_a.id, &FeedId::Numeric(5))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&found, &second));
    }

    #[tokio::test]
    async fn test_remove_participant_destroys_subscribers() {
        let registry = Registry::new();
        let room = RoomId::new("R1");
        let (a, conn_a) = participant(&room, "a");
        registry.add_participant(a).await;

        let sub = subscriber(conn_a.id, &room, 3);
        registry.add_subscriber(&room, conn_a.id, Arc::clone(&sub)).await;
        assert_eq!(
            registry
                .get_participant(&room, conn_a.id)
                .await
                .unwrap()
                .subscriber_count,
            1
        );

        registry.remove_participant(&room, conn_a.id).await;
        assert_eq!(sub.state().await, SubscriberState::TornDown);
    }

    #[tokio::test]
    async fn test_remove_subscriber() {
        let registry = Registry::new();
        let room = RoomId::new("R1");
        let (a, conn_a) = participant(&room, "a");
        registry.add_participant(a).await;

        let sub = subscriber(conn_a.id, &room, 3);
        registry.add_subscriber(&room, conn_a.id, Arc::clone(&sub)).await;

        assert!(
            registry
                .remove_subscriber(&room, conn_a.id, &FeedId::Numeric(3))
                .await
        );
        assert!(
            !registry
                .remove_subscriber(&room, conn_a.id, &FeedId::Numeric(3))
                .await
        );
        assert_eq!(sub.state().await, SubscriberState::TornDown);
    }
}
