//! Subscriber Session: one participant's inbound handle for one remote feed.
//!
//! State machine: `Detached -> Joined -> OfferSent -> Answered -> Active ->
//! TornDown`. A failed start or a gateway hangup tears the session down
//! itself; `destroy` is idempotent and detaches at most once.

use super::{Attachment, SessionEvent};
use crate::errors::SignalingError;
use crate::gateway::protocol::{
    feed_value, room_value, HandleId, IceCandidate, Jsep, VideoRoomData, VIDEOROOM_PLUGIN,
};
use crate::gateway::{GatewaySession, HandleEvent};

use common::types::{FeedId, ParticipantId, PrivateId, RoomId};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Subscriber lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Detached,
    Joined,
    OfferSent,
    Answered,
    Active,
    TornDown,
}

/// Event emitted by a subscriber session.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    /// The gateway's SDP offer for this subscription.
    Jsep(Jsep),
    Candidate(IceCandidate),
    /// The gateway hung up; the session has torn itself down.
    Hangup,
    /// Plugin failure reported by the gateway.
    Error(String),
}

struct SubscriberInner {
    state: SubscriberState,
    handle: Option<Attachment>,
}

/// Context shared by the session and its pump.
struct Shared {
    participant_id: ParticipantId,
    feed_id: FeedId,
    inner: Mutex<SubscriberInner>,
}

impl Shared {
    /// Take the handle and detach it best-effort. Returns false if already
    /// torn down.
    async fn release(&self) -> bool {
        let attachment = {
            let mut inner = self.inner.lock().await;
            if inner.state == SubscriberState::TornDown {
                return false;
            }
            inner.state = SubscriberState::TornDown;
            inner.handle.take()
        };

        if let Some(attachment) = attachment {
            match attachment.session() {
                Ok(session) => {
                    if let Err(e) = session.detach(attachment.id).await {
                        warn!(
                            target: "signal.subscriber",
                            participant_id = %self.participant_id,
                            feed_id = %self.feed_id,
                            handle_id = attachment.id,
                            error = %e,
                            "Subscriber detach failed"
                        );
                    }
                }
                Err(e) => {
                    debug!(target: "signal.subscriber", error = %e, "Skipping detach");
                }
            }
        }

        debug!(
            target: "signal.subscriber",
            participant_id = %self.participant_id,
            feed_id = %self.feed_id,
            "Subscriber destroyed"
        );
        true
    }

    async fn is_torn_down(&self) -> bool {
        self.inner.lock().await.state == SubscriberState::TornDown
    }
}

/// A participant's subscription to one remote feed.
pub struct SubscriberSession {
    room_id: RoomId,
    private_id: PrivateId,
    string_ids: bool,
    events: mpsc::Sender<SessionEvent>,
    shared: Arc<Shared>,
}

impl SubscriberSession {
    #[must_use]
    pub fn new(
        participant_id: ParticipantId,
        room_id: RoomId,
        feed_id: FeedId,
        private_id: PrivateId,
        string_ids: bool,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            room_id,
            private_id,
            string_ids,
            events,
            shared: Arc::new(Shared {
                participant_id,
                feed_id,
                inner: Mutex::new(SubscriberInner {
                    state: SubscriberState::Detached,
                    handle: None,
                }),
            }),
        }
    }

    #[must_use]
    pub fn feed_id(&self) -> &FeedId {
        &self.shared.feed_id
    }

    /// Attach a handle and send the subscriber join. The offer arrives as
    /// [`SubscriberEvent::Jsep`].
    ///
    /// On failure destroys itself and returns the error. Nothing is queued on
    /// the event channel.
    ///
    /// # Errors
    ///
    /// Gateway errors from the attach or join request.
    pub async fn start(&self, session: &Arc<dyn GatewaySession>) -> Result<(), SignalingError> {
        match self.try_start(session).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    target: "signal.subscriber",
                    room_id = %self.room_id,
                    participant_id = %self.shared.participant_id,
                    feed_id = %self.shared.feed_id,
                    error = %e,
                    "Subscriber start failed"
                );
                self.destroy().await;
                Err(e)
            }
        }
    }

    async fn try_start(&self, session: &Arc<dyn GatewaySession>) -> Result<(), SignalingError> {
        let (handle_id, handle_events) = session.attach(VIDEOROOM_PLUGIN).await?;

        {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == SubscriberState::TornDown {
                drop(inner);
                // Destroyed while attaching; give the handle straight back.
                if let Err(e) = session.detach(handle_id).await {
                    debug!(target: "signal.subscriber", error = %e, "Late detach failed");
                }
                return Ok(());
            }
            inner.handle = Some(Attachment::new(handle_id, session));
        }

        tokio::spawn(pump(
            handle_events,
            Arc::clone(&self.shared),
            self.events.clone(),
        ));

        let body = json!({
            "request": "join",
            "ptype": "subscriber",
            "room": room_value(&self.room_id, self.string_ids),
            "feed": feed_value(&self.shared.feed_id),
            "private_id": self.private_id.0,
        });
        session.message(handle_id, body, None).await?;

        let mut inner = self.shared.inner.lock().await;
        if inner.state == SubscriberState::Detached {
            inner.state = SubscriberState::Joined;
        }

        info!(
            target: "signal.subscriber",
            room_id = %self.room_id,
            participant_id = %self.shared.participant_id,
            feed_id = %self.shared.feed_id,
            handle_id = handle_id,
            "Subscriber join sent"
        );
        Ok(())
    }

    /// Send the client's answer with a `start` request.
    ///
    /// # Errors
    ///
    /// `NotAttached` without a handle; gateway errors otherwise.
    pub async fn submit_answer(&self, answer: Jsep) -> Result<(), SignalingError> {
        let (handle_id, session) = self.attached().await?;

        session
            .message(
                handle_id,
                json!({
                    "request": "start",
                    "room": room_value(&self.room_id, self.string_ids),
                }),
                Some(answer),
            )
            .await?;

        let mut inner = self.shared.inner.lock().await;
        if matches!(
            inner.state,
            SubscriberState::Joined | SubscriberState::OfferSent
        ) {
            inner.state = SubscriberState::Answered;
        }
        Ok(())
    }

    /// Trickle a client candidate. No-op without a handle.
    ///
    /// # Errors
    ///
    /// Gateway errors from the trickle request.
    pub async fn relay_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
        match self.attached().await {
            Ok((handle_id, session)) => session.trickle(handle_id, candidate).await,
            Err(SignalingError::NotAttached) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Detach the handle and stop emitting events. Never fails; safe to
    /// call more than once.
    pub async fn destroy(&self) {
        self.shared.release().await;
    }

    pub async fn state(&self) -> SubscriberState {
        self.shared.inner.lock().await.state
    }

    pub async fn handle_id(&self) -> Option<HandleId> {
        self.shared.inner.lock().await.handle.as_ref().map(|a| a.id)
    }

    async fn attached(&self) -> Result<(HandleId, Arc<dyn GatewaySession>), SignalingError> {
        let inner = self.shared.inner.lock().await;
        let attachment = inner.handle.as_ref().ok_or(SignalingError::NotAttached)?;
        Ok((attachment.id, attachment.session()?))
    }
}

async fn pump(
    mut handle_events: mpsc::Receiver<HandleEvent>,
    shared: Arc<Shared>,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some(event) = handle_events.recv().await {
        if shared.is_torn_down().await {
            break;
        }

        let mut out = Vec::new();
        let mut hangup = false;

        match event {
            HandleEvent::Message { data, jsep } => {
                if let Some(data) = data {
                    let data = VideoRoomData::from_value(&data);
                    if data.videoroom.as_deref() == Some("attached") {
                        debug!(
                            target: "signal.subscriber",
                            participant_id = %shared.participant_id,
                            feed_id = %shared.feed_id,
                            "Subscription attached"
                        );
                    }
                    if let Some(error) = data.error {
                        out.push(SubscriberEvent::Error(error));
                    }
                }
                if let Some(jsep) = jsep {
                    let mut inner = shared.inner.lock().await;
                    if inner.state == SubscriberState::Joined
                        || inner.state == SubscriberState::Detached
                    {
                        inner.state = SubscriberState::OfferSent;
                    }
                    out.push(SubscriberEvent::Jsep(jsep));
                }
            }
            HandleEvent::Candidate(candidate) => out.push(SubscriberEvent::Candidate(candidate)),
            HandleEvent::WebrtcUp => {
                shared.inner.lock().await.state = SubscriberState::Active;
                info!(
                    target: "signal.subscriber",
                    participant_id = %shared.participant_id,
                    feed_id = %shared.feed_id,
                    "Subscriber WebRTC up"
                );
            }
            HandleEvent::Hangup { reason } => {
                info!(
                    target: "signal.subscriber",
                    participant_id = %shared.participant_id,
                    feed_id = %shared.feed_id,
                    reason = ?reason,
                    "Subscriber hangup"
                );
                out.push(SubscriberEvent::Hangup);
                hangup = true;
            }
            HandleEvent::Detached => {
                shared.inner.lock().await.handle = None;
            }
            HandleEvent::Media { .. } | HandleEvent::SlowLink { .. } => {}
        }

        for event in out {
            let sent = events
                .send(SessionEvent::Subscriber {
                    feed_id: shared.feed_id.clone(),
                    event,
                })
                .await;
            if sent.is_err() {
                return;
            }
        }

        if hangup {
            shared.release().await;
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::gateway::GatewayConnector;
    use crate::sessions::publisher::{PublisherEvent, PublisherSession};
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Join a publisher in R1 and return its feed ID.
    async fn publishing_feed(gateway: &Arc<dyn GatewaySession>) -> (PublisherSession, FeedId) {
        let (tx, mut rx) = mpsc::channel(16);
        let publisher = PublisherSession::new(
            ParticipantId::new(),
            RoomId::new("R1"),
            "Alice".to_string(),
            PrivateId::generate(),
            true,
            tx,
        );
        publisher.join_as_publisher(gateway, None).await.unwrap();
        match next_event(&mut rx).await {
            SessionEvent::Publisher(PublisherEvent::Joined { feed_id, .. }) => (publisher, feed_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn subscriber(feed_id: FeedId) -> (SubscriberSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let session = SubscriberSession::new(
            ParticipantId::new(),
            RoomId::new("R1"),
            feed_id,
            PrivateId::generate(),
            true,
            tx,
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_negotiation_reaches_active() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (_alice, feed) = publishing_feed(&gateway).await;
        let (sub, mut events) = subscriber(feed.clone());

        sub.start(&gateway).await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Subscriber {
                feed_id: feed,
                event: SubscriberEvent::Jsep(Jsep::offer("v=0 mock-offer")),
            }
        );
        assert_eq!(sub.state().await, SubscriberState::OfferSent);

        sub.submit_answer(Jsep::answer("v=0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.state().await, SubscriberState::Active);
    }

    #[tokio::test]
    async fn test_unknown_feed_reports_error() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (sub, mut events) = subscriber(FeedId::Numeric(999));

        sub.start(&gateway).await.unwrap();
        match next_event(&mut events).await {
            SessionEvent::Subscriber {
                event: SubscriberEvent::Error(message),
                ..
            } => assert!(message.contains("No such feed")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_start_destroys_itself() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (sub, mut events) = subscriber(FeedId::Numeric(1));

        mock.set_message_failure(true);
        let result = sub.start(&gateway).await;
        assert!(result.is_err());

        assert!(events.try_recv().is_err());
        assert_eq!(sub.state().await, SubscriberState::TornDown);
        let handle = mock.last_handle().await.unwrap();
        assert_eq!(mock.detach_count(handle).await, 1);
    }

    #[tokio::test]
    async fn test_failed_start_returns_with_full_event_channel() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        tx.send(SessionEvent::Subscriber {
            feed_id: FeedId::Numeric(7),
            event: SubscriberEvent::Hangup,
        })
        .await
        .unwrap();

        let sub = SubscriberSession::new(
            ParticipantId::new(),
            RoomId::new("R1"),
            FeedId::Numeric(1),
            PrivateId::generate(),
            true,
            tx,
        );

        mock.set_message_failure(true);
        let result = tokio::time::timeout(Duration::from_secs(2), sub.start(&gateway))
            .await
            .expect("start must not wait on the event channel");
        assert!(result.is_err());
        assert_eq!(sub.state().await, SubscriberState::TornDown);
    }

    #[tokio::test]
    async fn test_destroy_twice_detaches_once() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (_alice, feed) = publishing_feed(&gateway).await;
        let (sub, _events) = subscriber(feed);

        sub.start(&gateway).await.unwrap();
        let handle = sub.handle_id().await.unwrap();

        sub.destroy().await;
        sub.destroy().await;

        assert_eq!(mock.detach_count(handle).await, 1);
        assert_eq!(sub.state().await, SubscriberState::TornDown);
    }

    #[tokio::test]
    async fn test_hangup_emits_and_self_destroys() {
        let mock = MockGateway::new();
        let gateway = mock.connect().await.unwrap();
        let (_alice, feed) = publishing_feed(&gateway).await;
        let (sub, mut events) = subscriber(feed);

        sub.start(&gateway).await.unwrap();
        next_event(&mut events).await;
        let handle = sub.handle_id().await.unwrap();

        mock.emit(handle, HandleEvent::Hangup { reason: None }).await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Subscriber {
                event: SubscriberEvent::Hangup,
                ..
            }
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.state().await, SubscriberState::TornDown);
        sub.destroy().await;
        assert_eq!(mock.detach_count(handle).await, 1);
    }

    #[tokio::test]
    async fn test_answer_requires_handle() {
        let (sub, _events) = subscriber(FeedId::Numeric(1));
        let result = sub.submit_answer(Jsep::answer("v=0")).await;
        assert!(matches!(result, Err(SignalingError::NotAttached)));
    }
}
