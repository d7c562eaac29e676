//! Publisher Session: one participant's outbound media handle.
//!
//! State machine: `Detached -> Attached -> Joined -> Publishing -> Left`.
//! The join request does not wait for the gateway's confirmation; the
//! `joined` plugin event carrying the feed ID arrives through the pump.

use super::{Attachment, SessionEvent};
use crate::errors::SignalingError;
use crate::gateway::protocol::{
    room_value, HandleId, IceCandidate, Jsep, PublisherInfo, VideoRoomData, VIDEOROOM_PLUGIN,
};
use crate::gateway::{GatewaySession, HandleEvent};

use common::types::{FeedId, ParticipantId, PrivateId, RoomId};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Publisher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Detached,
    Attached,
    Joined,
    Publishing,
    Left,
}

/// Event emitted by a publisher session.
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherEvent {
    /// SDP from the gateway (the answer to the participant's offer).
    Jsep(Jsep),
    /// ICE candidate from the gateway.
    Candidate(IceCandidate),
    /// The gateway confirmed the join.
    Joined {
        feed_id: FeedId,
        publishers: Vec<PublisherInfo>,
    },
    /// Other publishers announced in the room.
    Publishers(Vec<PublisherInfo>),
    /// A feed left the room.
    Leaving(FeedId),
    /// A feed stopped publishing.
    Unpublished(FeedId),
    /// Plugin-reported error.
    Error(String),
    /// PeerConnection is up.
    MediaUp,
    SlowLink { uplink: bool },
    Hangup { reason: Option<String> },
}

struct PublisherInner {
    state: PublisherState,
    handle: Option<Attachment>,
    feed_id: Option<FeedId>,
}

/// A participant's outbound media negotiation.
pub struct PublisherSession {
    participant_id: ParticipantId,
    room_id: RoomId,
    display_name: String,
    private_id: PrivateId,
    string_ids: bool,
    events: mpsc::Sender<SessionEvent>,
    inner: Arc<Mutex<PublisherInner>>,
}

impl PublisherSession {
    #[must_use]
    pub fn new(
        participant_id: ParticipantId,
        room_id: RoomId,
        display_name: String,
        private_id: PrivateId,
        string_ids: bool,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            participant_id,
            room_id,
            display_name,
            private_id,
            string_ids,
            events,
            inner: Arc::new(Mutex::new(PublisherInner {
                state: PublisherState::Detached,
                handle: None,
                feed_id: None,
            })),
        }
    }

    /// Open the plugin handle. Idempotent.
    ///
    /// # Errors
    ///
    /// Gateway errors from the attach request, or `Internal` after `leave`.
    pub async fn attach(
        &self,
        session: &Arc<dyn GatewaySession>,
    ) -> Result<HandleId, SignalingError> {
        let mut inner = self.inner.lock().await;

        if let Some(attachment) = &inner.handle {
            return Ok(attachment.id);
        }
        if inner.state == PublisherState::Left {
            return Err(SignalingError::Internal(
                "publisher session already left".to_string(),
            ));
        }

        let (handle_id, handle_events) = session.attach(VIDEOROOM_PLUGIN).await?;

        tokio::spawn(pump(
            handle_events,
            Arc::clone(&self.inner),
            self.events.clone(),
            self.room_id.clone(),
            self.participant_id,
        ));

        inner.handle = Some(Attachment::new(handle_id, session));
        inner.state = PublisherState::Attached;

        info!(
            target: "signal.publisher",
            room_id = %self.room_id,
            participant_id = %self.participant_id,
            handle_id = handle_id,
            "Publisher handle attached"
        );

        Ok(handle_id)
    }

    /// Send the publisher join, attaching first if needed.
    ///
    /// Resolves once the gateway accepts the request; the assigned feed ID
    /// arrives later as [`PublisherEvent::Joined`].
    ///
    /// # Errors
    ///
    /// Gateway errors from the attach or join request.
    pub async fn join_as_publisher(
        &self,
        session: &Arc<dyn GatewaySession>,
        offer: Option<Jsep>,
    ) -> Result<(), SignalingError> {
        let handle_id = self.attach(session).await?;

        let body = json!({
            "request": "join",
            "ptype": "publisher",
            "room": room_value(&self.room_id, self.string_ids),
            "display": self.display_name,
            "private_id": self.private_id.0,
        });

        debug!(
            target: "signal.publisher",
            room_id = %self.room_id,
            participant_id = %self.participant_id,
            handle_id = handle_id,
            "Sending publisher join"
        );

        session.message(handle_id, body, offer).await
    }

    /// Start publishing audio and video with the given offer.
    ///
    /// # Errors
    ///
    /// `NotAttached` before the handle exists; gateway errors otherwise.
    pub async fn publish(&self, offer: Jsep) -> Result<(), SignalingError> {
        let (handle_id, session) = self.attached().await?;

        session
            .message(
                handle_id,
                json!({"request": "publish", "audio": true, "video": true}),
                Some(offer),
            )
            .await?;

        let mut inner = self.inner.lock().await;
        if inner.state != PublisherState::Left {
            inner.state = PublisherState::Publishing;
        }
        Ok(())
    }

    /// Trickle a client candidate. Dropped silently before attach.
    ///
    /// # Errors
    ///
    /// Gateway errors from the trickle request.
    pub async fn relay_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
        match self.attached().await {
            Ok((handle_id, session)) => session.trickle(handle_id, candidate).await,
            Err(SignalingError::NotAttached) => {
                debug!(
                    target: "signal.publisher",
                    participant_id = %self.participant_id,
                    "Dropping candidate for unattached publisher"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Leave the room and detach. Safe to call more than once.
    pub async fn leave(&self) {
        let attachment = {
            let mut inner = self.inner.lock().await;
            inner.state = PublisherState::Left;
            inner.handle.take()
        };

        let Some(attachment) = attachment else {
            return;
        };

        let session = match attachment.session() {
            Ok(session) => session,
            Err(e) => {
                debug!(target: "signal.publisher", error = %e, "Skipping leave");
                return;
            }
        };

        if let Err(e) = session
            .message(attachment.id, json!({"request": "leave"}), None)
            .await
        {
            warn!(
                target: "signal.publisher",
                participant_id = %self.participant_id,
                handle_id = attachment.id,
                error = %e,
                "Leave request failed"
            );
        }

        if let Err(e) = session.detach(attachment.id).await {
            warn!(
                target: "signal.publisher",
                participant_id = %self.participant_id,
                handle_id = attachment.id,
                error = %e,
                "Detach failed"
            );
        }

        info!(
            target: "signal.publisher",
            room_id = %self.room_id,
            participant_id = %self.participant_id,
            "Publisher left"
        );
    }

    pub async fn state(&self) -> PublisherState {
        self.inner.lock().await.state
    }

    pub async fn feed_id(&self) -> Option<FeedId> {
        self.inner.lock().await.feed_id.clone()
    }

    pub async fn handle_id(&self) -> Option<HandleId> {
        self.inner.lock().await.handle.as_ref().map(|a| a.id)
    }

    async fn attached(&self) -> Result<(HandleId, Arc<dyn GatewaySession>), SignalingError> {
        let inner = self.inner.lock().await;
        let attachment = inner.handle.as_ref().ok_or(SignalingError::NotAttached)?;
        Ok((attachment.id, attachment.session()?))
    }
}

async fn pump(
    mut handle_events: mpsc::Receiver<HandleEvent>,
    inner: Arc<Mutex<PublisherInner>>,
    events: mpsc::Sender<SessionEvent>,
    room_id: RoomId,
    participant_id: ParticipantId,
) {
    while let Some(event) = handle_events.recv().await {
        for out in translate(event, &inner, &room_id, participant_id).await {
            if events.send(SessionEvent::Publisher(out)).await.is_err() {
                return;
            }
        }
    }

    debug!(
        target: "signal.publisher",
        participant_id = %participant_id,
        "Publisher event stream ended"
    );
}

async fn translate(
    event: HandleEvent,
    inner: &Mutex<PublisherInner>,
    room_id: &RoomId,
    participant_id: ParticipantId,
) -> Vec<PublisherEvent> {
    match event {
        HandleEvent::Message { data, jsep } => {
            let mut out = Vec::new();
            if let Some(jsep) = jsep {
                out.push(PublisherEvent::Jsep(jsep));
            }
            if let Some(data) = data {
                out.extend(plugin_events(&data, inner, room_id, participant_id).await);
            }
            out
        }
        HandleEvent::Candidate(candidate) => vec![PublisherEvent::Candidate(candidate)],
        HandleEvent::WebrtcUp => {
            info!(
                target: "signal.publisher",
                room_id = %room_id,
                participant_id = %participant_id,
                "Publisher WebRTC up"
            );
            vec![PublisherEvent::MediaUp]
        }
        HandleEvent::SlowLink { uplink } => {
            warn!(
                target: "signal.publisher",
                room_id = %room_id,
                participant_id = %participant_id,
                uplink = uplink,
                "Publisher slow link"
            );
            vec![PublisherEvent::SlowLink { uplink }]
        }
        HandleEvent::Hangup { reason } => {
            info!(
                target: "signal.publisher",
                room_id = %room_id,
                participant_id = %participant_id,
                reason = ?reason,
                "Publisher hangup"
            );
            vec![PublisherEvent::Hangup { reason }]
        }
        HandleEvent::Media { kind, receiving } => {
            debug!(
                target: "signal.publisher",
                participant_id = %participant_id,
                kind = ?kind,
                receiving = receiving,
                "Publisher media"
            );
            Vec::new()
        }
        HandleEvent::Detached => {
            info!(
                target: "signal.publisher",
                participant_id = %participant_id,
                "Publisher handle detached by gateway"
            );
            inner.lock().await.handle = None;
            Vec::new()
        }
    }
}

async fn plugin_events(
    data: &serde_json::Value,
    inner: &Mutex<PublisherInner>,
    room_id: &RoomId,
    participant_id: ParticipantId,
) -> Vec<PublisherEvent> {
    let data = VideoRoomData::from_value(data);
    let mut out = Vec::new();

    match data.videoroom.as_deref() {
        Some("joined") => {
            let Some(feed_id) = data.id else {
                warn!(target: "signal.publisher", "Joined event without feed ID");
                return out;
            };

            {
                let mut inner = inner.lock().await;
                if inner.state == PublisherState::Attached {
                    inner.state = PublisherState::Joined;
                }
                inner.feed_id = Some(feed_id.clone());
            }

            info!(
                target: "signal.publisher",
                room_id = %room_id,
                participant_id = %participant_id,
                feed_id = %feed_id,
                "Joined as publisher"
            );
            out.push(PublisherEvent::Joined {
                feed_id,
                publishers: data.publishers.unwrap_or_default(),
            });
        }
        Some("event") => {
            if let Some(publishers) = data.publishers.clone() {
                out.push(PublisherEvent::Publishers(publishers));
            }
            if let Some(feed) = data.leaving_feed() {
                out.push(PublisherEvent::Leaving(feed));
            }
            if let Some(feed) = data.unpublished_feed() {
                out.push(PublisherEvent::Unpublished(feed));
            }
            if let Some(error) = data.error {
                warn!(
                    target: "signal.publisher",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    error_code = ?data.error_code,
                    error = %error,
                    "Videoroom error"
                );
                out.push(PublisherEvent::Error(error));
            }
        }
        _ => {}
    }

    out
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::gateway::mock::{MockGateway, MockRequest};
    use crate::gateway::GatewayConnector;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> PublisherEvent {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
        {
            SessionEvent::Publisher(event) => event,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn publisher(display: &str) -> (PublisherSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let session = PublisherSession::new(
            ParticipantId::new(),
            RoomId::new("R1"),
            display.to_string(),
            PrivateId::generate(),
            true,
            tx,
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_join_emits_joined_with_feed_id() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (alice, mut events) = publisher("Alice");

        alice.join_as_publisher(&gateway, None).await.unwrap();

        match next_event(&mut events).await {
            PublisherEvent::Joined {
                feed_id,
                publishers,
            } => {
                assert!(publishers.is_empty());
                assert_eq!(alice.feed_id().await, Some(feed_id));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(alice.state().await, PublisherState::Joined);
    }

    #[tokio::test]
    async fn test_existing_publishers_see_new_joiner() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (alice, mut alice_events) = publisher("Alice");
        let (bob, mut bob_events) = publisher("Bob");

        alice.join_as_publisher(&gateway, None).await.unwrap();
        next_event(&mut alice_events).await;

        bob.join_as_publisher(&gateway, None).await.unwrap();
        let PublisherEvent::Joined {
            feed_id: bob_feed,
            publishers,
        } = next_event(&mut bob_events).await
        else {
            panic!("expected joined");
        };
        assert_eq!(publishers.len(), 1);

        match next_event(&mut alice_events).await {
            PublisherEvent::Publishers(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id, bob_feed);
                assert_eq!(list[0].display.as_deref(), Some("Bob"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_requires_handle() {
        let (alice, _events) = publisher("Alice");
        let result = alice.publish(Jsep::offer("v=0")).await;
        assert!(matches!(result, Err(SignalingError::NotAttached)));
    }

    #[tokio::test]
    async fn test_publish_relays_answer() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (alice, mut events) = publisher("Alice");

        alice.join_as_publisher(&gateway, None).await.unwrap();
        next_event(&mut events).await;

        alice.publish(Jsep::offer("v=0")).await.unwrap();
        assert_eq!(alice.state().await, PublisherState::Publishing);
        assert_eq!(
            next_event(&mut events).await,
            PublisherEvent::Jsep(Jsep::answer("v=0 mock-answer"))
        );
    }

    #[tokio::test]
    async fn test_candidate_before_attach_is_dropped() {
        let mock = MockGateway::new();
        let _gateway = mock.connect().await.unwrap();
        let (alice, _events) = publisher("Alice");

        alice
            .relay_ice_candidate(IceCandidate::completed())
            .await
            .unwrap();

        let trickles = mock
            .requests()
            .await
            .into_iter()
            .filter(|r| matches!(r, MockRequest::Trickle { .. }))
            .count();
        assert_eq!(trickles, 0);
    }

    #[tokio::test]
    async fn test_leave_twice_detaches_once() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (alice, _events) = publisher("Alice");

        let handle = alice.attach(&gateway).await.unwrap();
        alice.leave().await;
        alice.leave().await;

        assert_eq!(alice.state().await, PublisherState::Left);
        assert_eq!(mock.detach_count(handle).await, 1);

        let leaves = mock
            .requests()
            .await
            .into_iter()
            .filter(|r| {
                matches!(r, MockRequest::Message { body, .. } if body["request"] == "leave")
            })
            .count();
        assert_eq!(leaves, 1);
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (alice, _events) = publisher("Alice");

        let first = alice.attach(&gateway).await.unwrap();
        let second = alice.attach(&gateway).await.unwrap();
        assert_eq!(first, second);
    }
}
