//! `ConnectionActor` - one per accepted signaling connection.
//!
//! State machine: `connecting -> awaiting-token-validation -> active -> closed`.
//! Admission ([`admit`]) covers the first two states; the actor owns the
//! rest.
//!
//! # Lifecycle
//!
//! 1. Register the participant and issue the publisher join
//! 2. Send `connection-ready`
//! 3. Serve inbound frames and session events until the client goes away or
//!    the connection token is cancelled
//! 4. Leave, deregister, persist `left`, notify the room
//!
//! Session events are only read after `connection-ready` has been queued, so
//! a client always sees `connection-ready` before `joined`.

use super::protocol::{
    AnnouncedUser, ClientMessage, ErrorMessage, JoinedUser, ParseError, ParticipantEntry,
    ServerMessage, Usage,
};
use super::router::AppState;
use crate::errors::SignalingError;
use crate::gateway::protocol::{IceCandidate, PublisherInfo};
use crate::observability::metrics;
use crate::registry::{ConnectionHandle, FeedAssignment, Participant, ParticipantInfo};
use crate::sessions::{
    PublisherEvent, PublisherSession, SessionEvent, SubscriberEvent, SubscriberSession,
    SESSION_EVENT_BUFFER,
};
use crate::store::{ChatRole, ParticipantStatus, PendingParticipant};

use chrono::{SecondsFormat, Utc};
use common::types::{FeedId, ParticipantId, PrivateId, RoomId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of a connection's inbound frame channel.
pub const INBOUND_BUFFER: usize = 64;

/// `participant-left.reason` for a closed connection.
pub const LEFT_REASON: &str = "left";

/// Resolve a join token into the participant record it admits.
///
/// # Errors
///
/// `MissingJoinToken` for an absent or empty token, `InvalidJoinToken` for
/// an unknown or consumed one, `Store` if the lookup itself failed.
pub async fn admit(
    state: &AppState,
    token: Option<&str>,
) -> Result<PendingParticipant, SignalingError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(SignalingError::MissingJoinToken)?;

    state
        .store
        .consume_join_token(token)
        .await?
        .ok_or(SignalingError::InvalidJoinToken)
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    state: AppState,
    participant_id: ParticipantId,
    room_id: RoomId,
    info: ParticipantInfo,
    private_id: PrivateId,
    publisher: Arc<PublisherSession>,
    connection: ConnectionHandle,
    inbound: mpsc::Receiver<String>,
    events_tx: mpsc::Sender<SessionEvent>,
    events: mpsc::Receiver<SessionEvent>,
    cancel_token: CancellationToken,
}

impl ConnectionActor {
    /// Spawn the actor for an admitted participant.
    ///
    /// `inbound` carries the client's text frames; dropping its sender ends
    /// the connection. `cancel_token` must be the token `connection` was
    /// built with; the actor cancels it on exit.
    pub fn spawn(
        state: AppState,
        pending: PendingParticipant,
        connection: ConnectionHandle,
        inbound: mpsc::Receiver<String>,
        cancel_token: CancellationToken,
    ) -> (ParticipantId, JoinHandle<()>) {
        let participant_id = ParticipantId::new();
        let private_id = PrivateId::generate();
        let (events_tx, events) = mpsc::channel(SESSION_EVENT_BUFFER);

        let publisher = Arc::new(PublisherSession::new(
            participant_id,
            pending.room_id.clone(),
            pending.display_name.clone(),
            private_id,
            state.gateway.string_ids(),
            events_tx.clone(),
        ));

        let actor = Self {
            state,
            participant_id,
            room_id: pending.room_id,
            info: ParticipantInfo {
                record_id: pending.record_id,
                user_id: pending.user_id,
                display_name: pending.display_name,
            },
            private_id,
            publisher,
            connection,
            inbound,
            events_tx,
            events,
            cancel_token,
        };

        (participant_id, tokio::spawn(actor.run()))
    }

    #[instrument(
        skip_all,
        name = "signal.connection",
        fields(room_id = %self.room_id, participant_id = %self.participant_id)
    )]
    async fn run(mut self) {
        self.state
            .registry
            .add_participant(Participant::new(
                self.participant_id,
                self.room_id.clone(),
                self.connection.clone(),
                Arc::clone(&self.publisher),
                self.info.clone(),
            ))
            .await;

        match self.join().await {
            Ok(()) => {
                self.connection.send(&ServerMessage::ConnectionReady);
                info!(
                    target: "signal.connection",
                    room_id = %self.room_id,
                    participant_id = %self.participant_id,
                    "Connection ready"
                );
                self.serve().await;
            }
            Err(e) => {
                warn!(
                    target: "signal.connection",
                    room_id = %self.room_id,
                    participant_id = %self.participant_id,
                    error = %e,
                    "Publisher join failed"
                );
                self.connection.send(&ErrorMessage::new(
                    "GATEWAY_UNAVAILABLE",
                    Some(e.client_message()),
                ));
            }
        }

        self.teardown().await;
    }

    async fn join(&self) -> Result<(), SignalingError> {
        let gateway = &self.state.gateway;
        gateway
            .wait_until_connected(gateway.settings().connection_timeout)
            .await?;
        let session = gateway.session().await?;
        self.publisher.join_as_publisher(&session, None).await
    }

    async fn serve(&mut self) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "signal.connection",
                        participant_id = %self.participant_id,
                        "Connection cancelled"
                    );
                    break;
                }

                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame).await,
                    None => {
                        debug!(
                            target: "signal.connection",
                            participant_id = %self.participant_id,
                            "Client closed connection"
                        );
                        break;
                    }
                },

                Some(event) = self.events.recv() => self.handle_session_event(event).await,
            }
        }
    }

    async fn handle_frame(&self, frame: &str) {
        let message = match ClientMessage::parse(frame) {
            Ok(message) => message,
            Err(ParseError::UnknownType(kind)) => {
                warn!(
                    target: "signal.connection",
                    participant_id = %self.participant_id,
                    message_type = %kind,
                    "Unknown message type"
                );
                metrics::record_message("unknown");
                self.connection.send(&ErrorMessage::unknown_type());
                return;
            }
            Err(ParseError::Malformed(reason)) => {
                warn!(
                    target: "signal.connection",
                    participant_id = %self.participant_id,
                    reason = %reason,
                    "Malformed message"
                );
                metrics::record_message("malformed");
                self.connection
                    .send(&ErrorMessage::new("MESSAGE_PROCESSING_ERROR", Some(reason)));
                return;
            }
        };

        let kind = message.kind();
        metrics::record_message(kind);
        debug!(
            target: "signal.connection",
            participant_id = %self.participant_id,
            message_type = kind,
            "Inbound message"
        );

        if let Err(e) = self.dispatch(message).await {
            warn!(
                target: "signal.connection",
                participant_id = %self.participant_id,
                message_type = kind,
                error = %e,
                "Message processing failed"
            );
            self.connection
                .send(&ErrorMessage::new(e.error_code(), Some(e.client_message())));
        }
    }

    async fn dispatch(&self, message: ClientMessage) -> Result<(), SignalingError> {
        match message {
            ClientMessage::Publish { jsep } => self.publisher.publish(jsep).await,
            ClientMessage::Subscribe { target_feed_id } => self.subscribe(target_feed_id).await,
            ClientMessage::SdpAnswer {
                target_feed_id,
                jsep,
            } => match self.subscriber(&target_feed_id).await {
                Some(subscriber) => subscriber.submit_answer(jsep).await,
                None => {
                    debug!(
                        target: "signal.connection",
                        feed_id = %target_feed_id,
                        "Answer for unknown subscription ignored"
                    );
                    Ok(())
                }
            },
            ClientMessage::IceCandidate {
                usage,
                target_feed_id,
                candidate,
            } => self.relay_candidate(usage, target_feed_id, candidate).await,
            ClientMessage::SendMessage { text } => {
                self.chat(text).await;
                Ok(())
            }
            ClientMessage::AiQuery { query } => {
                self.state
                    .chat_context
                    .add_message(&self.room_id, ChatRole::User, query.clone())
                    .await;
                self.state
                    .ai
                    .dispatch(
                        &self.room_id,
                        self.participant_id,
                        query,
                        self.connection.clone(),
                    )
                    .await;
                Ok(())
            }
        }
    }

    async fn subscribe(&self, feed_id: FeedId) -> Result<(), SignalingError> {
        let session = self.state.gateway.session().await?;

        let subscriber = Arc::new(SubscriberSession::new(
            self.participant_id,
            self.room_id.clone(),
            feed_id.clone(),
            self.private_id,
            self.state.gateway.string_ids(),
            self.events_tx.clone(),
        ));

        if !self
            .state
            .registry
            .add_subscriber(&self.room_id, self.participant_id, Arc::clone(&subscriber))
            .await
        {
            return Err(SignalingError::Internal(
                "participant is not registered".to_string(),
            ));
        }

        if let Err(e) = subscriber.start(&session).await {
            self.connection.send(&ErrorMessage::new(
                "SUBSCRIBE_FAILED",
                Some(e.client_message()),
            ));
            self.state
                .registry
                .remove_subscriber(&self.room_id, self.participant_id, &feed_id)
                .await;
        }
        Ok(())
    }

    async fn subscriber(&self, feed_id: &FeedId) -> Option<Arc<SubscriberSession>> {
        self.state
            .registry
            .get_subscriber(&self.room_id, self.participant_id, feed_id)
            .await
    }

    async fn relay_candidate(
        &self,
        usage: Usage,
        target_feed_id: Option<FeedId>,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        match usage {
            Usage::Publish => self.publisher.relay_ice_candidate(candidate).await,
            Usage::Subscribe => {
                let Some(feed_id) = target_feed_id else {
                    return Ok(());
                };
                match self.subscriber(&feed_id).await {
                    Some(subscriber) => subscriber.relay_ice_candidate(candidate).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn chat(&self, text: Option<String>) {
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            return;
        };

        self.state
            .chat_context
            .add_message(&self.room_id, ChatRole::User, text.clone())
            .await;

        let delivered = self
            .state
            .registry
            .broadcast(
                &self.room_id,
                &ServerMessage::ChatMessage {
                    room_id: self.room_id.clone(),
                    from: self.info.clone(),
                    text,
                    timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                },
                Some(self.participant_id),
            )
            .await;

        debug!(
            target: "signal.connection",
            room_id = %self.room_id,
            participant_id = %self.participant_id,
            delivered = delivered,
            "Chat message broadcast"
        );
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Publisher(event) => self.handle_publisher_event(event).await,
            SessionEvent::Subscriber { feed_id, event } => {
                self.handle_subscriber_event(feed_id, event).await;
            }
        }
    }

    async fn handle_publisher_event(&self, event: PublisherEvent) {
        match event {
            PublisherEvent::Jsep(jsep) => {
                self.connection.send(&ServerMessage::SdpAnswer {
                    usage: Usage::Publish,
                    jsep,
                });
            }
            PublisherEvent::Candidate(candidate) => {
                self.connection.send(&ServerMessage::IceCandidate {
                    usage: Usage::Publish,
                    target_feed_id: None,
                    candidate,
                });
            }
            PublisherEvent::Joined { feed_id, .. } => self.on_joined(feed_id).await,
            PublisherEvent::Publishers(publishers) => self.announce(publishers).await,
            PublisherEvent::Leaving(feed_id) | PublisherEvent::Unpublished(feed_id) => {
                self.state
                    .registry
                    .remove_subscriber(&self.room_id, self.participant_id, &feed_id)
                    .await;
            }
            PublisherEvent::Error(reason) => {
                self.connection.send(&ErrorMessage::new(
                    "GATEWAY_REQUEST_FAILED",
                    Some(reason),
                ));
            }
            PublisherEvent::MediaUp
            | PublisherEvent::SlowLink { .. }
            | PublisherEvent::Hangup { .. } => {}
        }
    }

    /// First `joined` assigns the feed and announces the participant; any
    /// later one is ignored.
    async fn on_joined(&self, feed_id: FeedId) {
        match self
            .state
            .registry
            .set_feed_id(&self.room_id, self.participant_id, feed_id.clone())
            .await
        {
            FeedAssignment::Assigned => {}
            FeedAssignment::AlreadySet(existing) => {
                debug!(
                    target: "signal.connection",
                    participant_id = %self.participant_id,
                    feed_id = %existing,
                    "Repeated joined event ignored"
                );
                return;
            }
            FeedAssignment::UnknownParticipant => return,
        }

        if let Err(e) = self
            .state
            .store
            .update_status(
                self.info.record_id,
                ParticipantStatus::Active,
                Some(&feed_id),
            )
            .await
        {
            warn!(
                target: "signal.connection",
                participant_id = %self.participant_id,
                error = %e,
                "Failed to persist active status"
            );
        }

        let participants = self
            .state
            .registry
            .list_participants(&self.room_id)
            .await
            .into_iter()
            .filter(|p| p.participant_id != self.participant_id)
            .filter_map(|p| {
                p.feed_id.map(|feed_id| ParticipantEntry {
                    feed_id,
                    user_info: p.info,
                })
            })
            .collect();

        self.connection.send(&ServerMessage::Joined {
            room_id: self.room_id.clone(),
            feed_id: feed_id.clone(),
            participants,
        });

        self.state
            .registry
            .broadcast(
                &self.room_id,
                &ServerMessage::ParticipantJoined {
                    room_id: self.room_id.clone(),
                    feed_id,
                    user: JoinedUser::Registered(self.info.clone()),
                },
                Some(self.participant_id),
            )
            .await;
    }

    /// Forward gateway publisher announcements for feeds that no registered
    /// participant owns.
    async fn announce(&self, publishers: Vec<PublisherInfo>) {
        for publisher in publishers {
            if self
                .state
                .registry
                .has_feed(&self.room_id, &publisher.id)
                .await
            {
                continue;
            }
            self.connection.send(&ServerMessage::ParticipantJoined {
                room_id: self.room_id.clone(),
                feed_id: publisher.id,
                user: JoinedUser::Announced(AnnouncedUser {
                    display_name: publisher.display,
                }),
            });
        }
    }

    async fn handle_subscriber_event(&self, feed_id: FeedId, event: SubscriberEvent) {
        match event {
            SubscriberEvent::Jsep(jsep) => {
                self.connection.send(&ServerMessage::SdpOffer {
                    usage: Usage::Subscribe,
                    target_feed_id: Some(feed_id),
                    jsep,
                });
            }
            SubscriberEvent::Candidate(candidate) => {
                self.connection.send(&ServerMessage::IceCandidate {
                    usage: Usage::Subscribe,
                    target_feed_id: Some(feed_id),
                    candidate,
                });
            }
            SubscriberEvent::Hangup => {
                self.state
                    .registry
                    .remove_subscriber(&self.room_id, self.participant_id, &feed_id)
                    .await;
            }
            SubscriberEvent::Error(reason) => {
                self.connection
                    .send(&ErrorMessage::new("SUBSCRIBE_FAILED", Some(reason)));
                self.state
                    .registry
                    .remove_subscriber(&self.room_id, self.participant_id, &feed_id)
                    .await;
            }
        }
    }

    async fn teardown(&self) {
        self.publisher.leave().await;

        let removed = self
            .state
            .registry
            .remove_participant(&self.room_id, self.participant_id)
            .await;

        if let Some(removed) = removed {
            if let Err(e) = self
                .state
                .store
                .update_status(removed.info.record_id, ParticipantStatus::Left, None)
                .await
            {
                warn!(
                    target: "signal.connection",
                    participant_id = %self.participant_id,
                    error = %e,
                    "Failed to persist left status"
                );
            }

            self.state
                .registry
                .broadcast(
                    &self.room_id,
                    &ServerMessage::ParticipantLeft {
                        room_id: self.room_id.clone(),
                        user_id: removed.info.user_id,
                        feed_id: removed.feed_id,
                        reason: LEFT_REASON.to_string(),
                    },
                    Some(self.participant_id),
                )
                .await;

            if removed.room_now_empty {
                self.state.room_state.clear_room(&self.room_id).await;
            }
        }

        self.cancel_token.cancel();

        info!(
            target: "signal.connection",
            room_id = %self.room_id,
            participant_id = %self.participant_id,
            "Connection closed"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::gateway::mock::{MockGateway, MockRequest};
    use crate::gateway::{GatewayConnectionManager, GatewaySettings, HandleEvent};
    use crate::registry::{Registry, OUTBOUND_BUFFER};
    use crate::store::{ChatContextStore, DisabledAiDispatcher, MemoryParticipantStore};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::task::TaskTracker;

    struct Harness {
        state: AppState,
        mock: MockGateway,
        store: MemoryParticipantStore,
        chat: Arc<ChatContextStore>,
    }

    impl Harness {
        async fn new() -> Self {
            let mock = MockGateway::new();
            let gateway =
                GatewayConnectionManager::new(GatewaySettings::default(), mock.connector());
            gateway.connect().await.unwrap();

            let store = MemoryParticipantStore::new();
            let chat = Arc::new(ChatContextStore::new());
            let state = AppState {
                registry: Registry::new(),
                gateway,
                store: Arc::new(store.clone()),
                room_state: chat.clone(),
                ai: Arc::new(DisabledAiDispatcher),
                chat_context: chat.clone(),
                shutdown: CancellationToken::new(),
                connections: TaskTracker::new(),
            };

            Self {
                state,
                mock,
                store,
                chat,
            }
        }

        async fn join(&self, room: &str, name: &str) -> Client {
            let token = format!("token-{name}");
            let record_id = self
                .store
                .insert_pending(&token, &RoomId::new(room), Some(name), name)
                .await;
            let pending = admit(&self.state, Some(&token)).await.unwrap();

            let (out_tx, outbound) = mpsc::channel(OUTBOUND_BUFFER);
            let (inbound, in_rx) = mpsc::channel(INBOUND_BUFFER);
            let cancel = CancellationToken::new();
            let handle = ConnectionHandle::new(out_tx, cancel.clone());

            let (participant_id, task) =
                ConnectionActor::spawn(self.state.clone(), pending, handle, in_rx, cancel);

            Client {
                participant_id,
                record_id,
                inbound: Some(inbound),
                outbound,
                task,
            }
        }
    }

    struct Client {
        participant_id: ParticipantId,
        record_id: uuid::Uuid,
        inbound: Option<mpsc::Sender<String>>,
        outbound: mpsc::Receiver<String>,
        task: JoinHandle<()>,
    }

    impl Client {
        async fn next(&mut self) -> Value {
            let frame = timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("connection closed");
            serde_json::from_str(&frame).unwrap()
        }

        /// Skip messages until one of `kind` arrives.
        async fn next_of(&mut self, kind: &str) -> Value {
            loop {
                let message = self.next().await;
                if message["type"] == kind {
                    return message;
                }
            }
        }

        async fn send(&self, frame: Value) {
            self.inbound
                .as_ref()
                .unwrap()
                .send(frame.to_string())
                .await
                .unwrap();
        }

        async fn close(mut self) {
            self.inbound.take();
            timeout(Duration::from_secs(2), self.task)
                .await
                .expect("actor should stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_admit_rejects_missing_and_invalid_tokens() {
        let harness = Harness::new().await;

        assert!(matches!(
            admit(&harness.state, None).await,
            Err(SignalingError::MissingJoinToken)
        ));
        assert!(matches!(
            admit(&harness.state, Some("")).await,
            Err(SignalingError::MissingJoinToken)
        ));
        assert!(matches!(
            admit(&harness.state, Some("nope")).await,
            Err(SignalingError::InvalidJoinToken)
        ));

        harness
            .store
            .insert_pending("once", &RoomId::new("R1"), None, "Guest")
            .await;
        assert!(admit(&harness.state, Some("once")).await.is_ok());
        assert!(matches!(
            admit(&harness.state, Some("once")).await,
            Err(SignalingError::InvalidJoinToken)
        ));
    }

    #[tokio::test]
    async fn test_connection_ready_precedes_joined() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;

        assert_eq!(alice.next().await["type"], "connection-ready");

        let joined = alice.next().await;
        assert_eq!(joined["type"], "joined");
        assert_eq!(joined["data"]["roomId"], "R1");
        assert!(joined["data"]["feedId"].is_u64());
        assert_eq!(joined["data"]["participants"], serde_json::json!([]));

        assert_eq!(
            harness.store.status(alice.record_id).await,
            Some(ParticipantStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_second_joiner_is_announced_and_listed() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        let alice_feed = alice.next_of("joined").await["data"]["feedId"].clone();

        let mut bob = harness.join("R1", "bob").await;
        let bob_joined = bob.next_of("joined").await;
        let bob_feed = bob_joined["data"]["feedId"].clone();

        let participants = bob_joined["data"]["participants"].as_array().unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0]["feedId"], alice_feed);
        assert_eq!(participants[0]["userInfo"]["displayName"], "alice");

        let announced = alice.next_of("participant-joined").await;
        assert_eq!(announced["data"]["roomId"], "R1");
        assert_eq!(announced["data"]["feedId"], bob_feed);
    }

    #[tokio::test]
    async fn test_chat_reaches_everyone_but_the_sender() {
        let harness = Harness::new().await;
        let mut a = harness.join("R1", "a").await;
        a.next_of("joined").await;
        let mut b = harness.join("R1", "b").await;
        b.next_of("joined").await;
        let mut c = harness.join("R1", "c").await;
        c.next_of("joined").await;

        a.send(serde_json::json!({"type": "send-message", "data": {"text": "hi"}}))
            .await;
        a.send(serde_json::json!({"type": "send-message", "data": {"text": ""}}))
            .await;
        a.send(serde_json::json!({"type": "dance"})).await;

        for client in [&mut b, &mut c] {
            let chat = client.next_of("chat-message").await;
            assert_eq!(chat["data"]["from"]["userId"], "a");
            assert_eq!(chat["data"]["text"], "hi");
            assert_eq!(chat["data"]["roomId"], "R1");
        }

        // The unknown type is the next thing A sees that is not a presence event
        let error = a.next_of("error").await;
        assert_eq!(error["code"], "UNKNOWN_MESSAGE_TYPE");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        alice.next_of("joined").await;

        alice.send(Value::String("{".to_string())).await;
        let error = alice.next_of("error").await;
        assert_eq!(error["code"], "MESSAGE_PROCESSING_ERROR");

        alice
            .send(serde_json::json!({"type": "send-message", "data": {"text": "still here"}}))
            .await;
        alice.send(serde_json::json!({"type": "bogus"})).await;
        assert_eq!(alice.next_of("error").await["code"], "UNKNOWN_MESSAGE_TYPE");
    }

    #[tokio::test]
    async fn test_publish_relays_answer() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        alice.next_of("joined").await;

        alice
            .send(serde_json::json!({
                "type": "publish",
                "data": {"jsep": {"type": "offer", "sdp": "v=0 client-offer"}}
            }))
            .await;

        let answer = alice.next_of("sdp-answer").await;
        assert_eq!(answer["data"]["usage"], "publish");
        assert_eq!(answer["data"]["jsep"]["type"], "answer");
    }

    #[tokio::test]
    async fn test_subscribe_offer_answer_flow() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        let alice_feed = alice.next_of("joined").await["data"]["feedId"].clone();
        let mut bob = harness.join("R1", "bob").await;
        bob.next_of("joined").await;

        bob.send(serde_json::json!({"type": "subscribe", "data": {"targetFeedId": alice_feed}}))
            .await;
        let offer = bob.next_of("sdp-offer").await;
        assert_eq!(offer["data"]["usage"], "subscribe");
        assert_eq!(offer["data"]["targetFeedId"], alice_feed);

        bob.send(serde_json::json!({
            "type": "sdp-answer",
            "data": {"targetFeedId": alice_feed, "jsep": {"type": "answer", "sdp": "v=0 bob"}}
        }))
        .await;
        bob.send(serde_json::json!({
            "type": "ice-candidate",
            "data": {"usage": "subscribe", "targetFeedId": alice_feed, "candidate": {"completed": true}}
        }))
        .await;
        bob.send(serde_json::json!({"type": "bogus"})).await;
        bob.next_of("error").await;

        let requests = harness.mock.requests().await;
        assert!(requests.iter().any(|r| matches!(
            r,
            MockRequest::Message { body, jsep: Some(_), .. } if body["request"] == "start"
        )));
        assert!(requests
            .iter()
            .any(|r| matches!(r, MockRequest::Trickle { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_to_unknown_feed_reports_failure() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        alice.next_of("joined").await;

        alice
            .send(serde_json::json!({"type": "subscribe", "data": {"targetFeedId": 99999}}))
            .await;

        let error = alice.next_of("error").await;
        assert_eq!(error["code"], "SUBSCRIBE_FAILED");
    }

    #[tokio::test]
    async fn test_close_notifies_room_and_clears_empty_room() {
        let harness = Harness::new().await;
        let room = RoomId::new("R1");

        let mut alice = harness.join("R1", "alice").await;
        let alice_feed = alice.next_of("joined").await["data"]["feedId"].clone();
        let mut bob = harness.join("R1", "bob").await;
        bob.next_of("joined").await;

        alice
            .send(serde_json::json!({"type": "send-message", "data": {"text": "hello"}}))
            .await;
        bob.next_of("chat-message").await;

        let alice_record = alice.record_id;
        alice.close().await;

        let left = bob.next_of("participant-left").await;
        assert_eq!(left["data"]["userId"], "alice");
        assert_eq!(left["data"]["feedId"], alice_feed);
        assert_eq!(left["data"]["reason"], "left");
        assert_eq!(
            harness.store.status(alice_record).await,
            Some(ParticipantStatus::Left)
        );
        assert_eq!(harness.chat.get_context(&room).await.len(), 1);

        let bob_id = bob.participant_id;
        bob.close().await;

        assert_eq!(harness.state.registry.room_count().await, 0);
        assert!(harness
            .state
            .registry
            .get_participant(&room, bob_id)
            .await
            .is_none());
        assert!(harness.chat.get_context(&room).await.is_empty());
    }

    #[tokio::test]
    async fn test_join_failure_reports_gateway_unavailable() {
        let harness = Harness::new().await;
        harness.mock.set_message_failure(true);

        let mut alice = harness.join("R1", "alice").await;
        let error = alice.next().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "GATEWAY_UNAVAILABLE");

        timeout(Duration::from_secs(2), alice.task)
            .await
            .expect("actor should stop")
            .unwrap();
        assert_eq!(harness.state.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_ai_query_without_assistant() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        alice.next_of("joined").await;

        alice
            .send(serde_json::json!({"type": "ai-query", "data": {"query": "hello?"}}))
            .await;
        let reply = alice.next_of("ai-error").await;
        assert_eq!(reply["data"]["code"], "AI_UNAVAILABLE");

        let context = harness.chat.get_context(&RoomId::new("R1")).await;
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].role, ChatRole::User);
        assert_eq!(context[0].content, "hello?");
    }

    #[tokio::test]
    async fn test_repeated_joined_event_is_not_rebroadcast() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        alice.next_of("joined").await;
        let mut bob = harness.join("R1", "bob").await;
        let bob_feed = bob.next_of("joined").await["data"]["feedId"].clone();
        assert_eq!(alice.next_of("participant-joined").await["data"]["feedId"], bob_feed);

        let bob_handle = harness
            .state
            .registry
            .get_participant(&RoomId::new("R1"), bob.participant_id)
            .await
            .unwrap()
            .publisher
            .handle_id()
            .await
            .unwrap();
        assert!(
            harness
                .mock
                .emit(
                    bob_handle,
                    HandleEvent::Message {
                        data: Some(serde_json::json!({"videoroom": "joined", "id": 424_242})),
                        jsep: None,
                    },
                )
                .await
        );

        tokio::time::sleep(Duration::from_millis(100)).await;

        // Flush both connections with a request each must answer
        for client in [&mut alice, &mut bob] {
            client.send(serde_json::json!({"type": "bogus"})).await;
            loop {
                let message = client.next().await;
                assert_ne!(message["type"], "participant-joined");
                assert_ne!(message["type"], "joined");
                if message["type"] == "error" {
                    break;
                }
            }
        }

        let snapshot = harness
            .state
            .registry
            .get_participant(&RoomId::new("R1"), bob.participant_id)
            .await
            .unwrap();
        assert_eq!(
            snapshot.feed_id,
            Some(FeedId::Numeric(bob_feed.as_u64().unwrap()))
        );
    }

    #[tokio::test]
    async fn test_subscribe_start_failure_keeps_connection_alive() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        let alice_feed = alice.next_of("joined").await["data"]["feedId"].clone();
        let mut bob = harness.join("R1", "bob").await;
        bob.next_of("joined").await;

        harness.mock.set_message_failure(true);
        bob.send(serde_json::json!({"type": "subscribe", "data": {"targetFeedId": alice_feed}}))
            .await;
        let error = bob.next_of("error").await;
        assert_eq!(error["code"], "SUBSCRIBE_FAILED");
        harness.mock.set_message_failure(false);

        let feed = FeedId::Numeric(alice_feed.as_u64().unwrap());
        assert!(harness
            .state
            .registry
            .get_subscriber(&RoomId::new("R1"), bob.participant_id, &feed)
            .await
            .is_none());

        bob.send(serde_json::json!({"type": "subscribe", "data": {"targetFeedId": alice_feed}}))
            .await;
        bob.next_of("sdp-offer").await;

        bob.close().await;
        alice.next_of("participant-left").await;
    }

    #[tokio::test]
    async fn test_leaving_publisher_drops_subscription() {
        let harness = Harness::new().await;
        let mut alice = harness.join("R1", "alice").await;
        let alice_feed = alice.next_of("joined").await["data"]["feedId"].clone();
        let mut bob = harness.join("R1", "bob").await;
        bob.next_of("joined").await;

        bob.send(serde_json::json!({"type": "subscribe", "data": {"targetFeedId": alice_feed}}))
            .await;
        bob.next_of("sdp-offer").await;

        let feed = FeedId::Numeric(alice_feed.as_u64().unwrap());
        let bob_id = bob.participant_id;
        assert!(harness
            .state
            .registry
            .get_subscriber(&RoomId::new("R1"), bob_id, &feed)
            .await
            .is_some());

        alice.close().await;
        bob.next_of("participant-left").await;

        let mut dropped = false;
        for _ in 0..50 {
            if harness
                .state
                .registry
                .get_subscriber(&RoomId::new("R1"), bob_id, &feed)
                .await
                .is_none()
            {
                dropped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped, "subscription to the departed feed should be dropped");
    }
}
