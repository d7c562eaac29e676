//! In-process scripted gateway.
//!
//! `MockGateway` implements [`GatewayConnector`] without a network. Every
//! request is recorded, failures can be scripted, and a small videoroom
//! model answers publisher joins with a `joined` event carrying a fresh
//! feed ID, subscriber joins with an offer, and `start` with `webrtcup`.

use super::protocol::{HandleId, IceCandidate, Jsep};
use super::transport::{GatewayConnector, GatewaySession, HandleEvent, HANDLE_EVENT_BUFFER};
use crate::errors::{SignalingError, VIDEOROOM_NO_SUCH_ROOM};

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Videoroom error code for creating a room that already exists.
const VIDEOROOM_ROOM_EXISTS: i64 = 427;

/// Videoroom error code for subscribing to an unknown feed.
const VIDEOROOM_NO_SUCH_FEED: i64 = 428;

/// Request recorded by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum MockRequest {
    Attach { plugin: String, handle: HandleId },
    Message { handle: HandleId, body: Value, jsep: Option<Jsep> },
    Request { handle: HandleId, body: Value },
    Trickle { handle: HandleId, candidate: IceCandidate },
    Detach { handle: HandleId },
    Info,
    Destroy { session_id: u64 },
    Close { session_id: u64 },
}

#[derive(Debug, Clone)]
struct MockPublisher {
    feed: u64,
    handle: HandleId,
    display: Option<String>,
}

#[derive(Default)]
struct MockState {
    next_id: AtomicU64,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    fail_info: AtomicBool,
    fail_messages: AtomicBool,
    requests: Mutex<Vec<MockRequest>>,
    handles: Mutex<HashMap<HandleId, mpsc::Sender<HandleEvent>>>,
    rooms: Mutex<HashSet<String>>,
    publishers: Mutex<HashMap<String, Vec<MockPublisher>>>,
    current: Mutex<Option<Arc<MockSession>>>,
}

impl MockState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn record(&self, request: MockRequest) {
        self.requests.lock().await.push(request);
    }

    async fn send(&self, handle: HandleId, event: HandleEvent) -> bool {
        match self.handles.lock().await.get(&handle) {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }
}

/// Scripted in-process gateway.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<MockState>,
}

impl MockGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The mock as a connector for [`super::GatewayConnectionManager`].
    #[must_use]
    pub fn connector(&self) -> Arc<dyn GatewayConnector> {
        Arc::new(self.clone())
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make `info` (the health check) fail until reset.
    pub fn set_info_failure(&self, fail: bool) {
        self.state.fail_info.store(fail, Ordering::SeqCst);
    }

    /// Make plugin messages fail until reset.
    pub fn set_message_failure(&self, fail: bool) {
        self.state.fail_messages.store(fail, Ordering::SeqCst);
    }

    /// Connect attempts so far, failed ones included.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Simulate a transport close on the current session.
    pub async fn close_current(&self) {
        if let Some(session) = self.state.current.lock().await.as_ref() {
            session.closed.cancel();
        }
    }

    /// Deliver an event to a handle. Returns false if the handle is unknown.
    pub async fn emit(&self, handle: HandleId, event: HandleEvent) -> bool {
        self.state.send(handle, event).await
    }

    pub async fn requests(&self) -> Vec<MockRequest> {
        self.state.requests.lock().await.clone()
    }

    /// Number of detach requests for `handle`.
    pub async fn detach_count(&self, handle: HandleId) -> usize {
        self.state
            .requests
            .lock()
            .await
            .iter()
            .filter(|r| matches!(r, MockRequest::Detach { handle: h } if *h == handle))
            .count()
    }

    /// Most recently attached handle.
    pub async fn last_handle(&self) -> Option<HandleId> {
        self.state
            .requests
            .lock()
            .await
            .iter()
            .rev()
            .find_map(|r| match r {
                MockRequest::Attach { handle, .. } => Some(*handle),
                _ => None,
            })
    }

    /// Pre-create a room.
    pub async fn add_room(&self, room: &str) {
        self.state.rooms.lock().await.insert(room.to_string());
    }

    pub async fn has_room(&self, room: &str) -> bool {
        self.state.rooms.lock().await.contains(room)
    }

    /// Feed IDs currently publishing in `room`.
    pub async fn publisher_feeds(&self, room: &str) -> Vec<u64> {
        self.state
            .publishers
            .lock()
            .await
            .get(room)
            .map(|list| list.iter().map(|p| p.feed).collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl GatewayConnector for MockGateway {
    async fn connect(&self) -> Result<Arc<dyn GatewaySession>, SignalingError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SignalingError::GatewayUnreachable(
                "scripted connect failure".to_string(),
            ));
        }

        let session = Arc::new(MockSession {
            id: self.state.next_id(),
            state: Arc::clone(&self.state),
            closed: CancellationToken::new(),
        });
        *self.state.current.lock().await = Some(Arc::clone(&session));

        Ok(session)
    }
}

/// One scripted control session.
pub struct MockSession {
    id: u64,
    state: Arc<MockState>,
    closed: CancellationToken,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), SignalingError> {
        if self.closed.is_cancelled() {
            return Err(SignalingError::GatewayUnreachable(
                "mock transport closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn videoroom_message(&self, handle: HandleId, body: &Value, jsep: Option<Jsep>) {
        let request = body.get("request").and_then(Value::as_str).unwrap_or("");
        let room = body.get("room").map(value_key).unwrap_or_default();

        match (request, body.get("ptype").and_then(Value::as_str)) {
            ("join", Some("publisher")) => {
                let feed = self.state.next_id();
                let display = body
                    .get("display")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let others = {
                    let mut publishers = self.state.publishers.lock().await;
                    let list = publishers.entry(room.clone()).or_default();
                    let others: Vec<MockPublisher> = list.clone();
                    list.push(MockPublisher {
                        feed,
                        handle,
                        display: display.clone(),
                    });
                    others
                };

                let listed: Vec<Value> = others
                    .iter()
                    .map(|p| json!({"id": p.feed, "display": p.display}))
                    .collect();
                self.state
                    .send(
                        handle,
                        HandleEvent::Message {
                            data: Some(json!({
                                "videoroom": "joined",
                                "room": room,
                                "id": feed,
                                "publishers": listed,
                            })),
                            jsep: jsep.map(|_| Jsep::answer("v=0 mock-answer")),
                        },
                    )
                    .await;

                for other in others {
                    self.state
                        .send(
                            other.handle,
                            HandleEvent::Message {
                                data: Some(json!({
                                    "videoroom": "event",
                                    "room": room,
                                    "publishers": [{"id": feed, "display": display}],
                                })),
                                jsep: None,
                            },
                        )
                        .await;
                }
            }
            ("join", Some("subscriber")) => {
                let feed = body.get("feed").cloned().unwrap_or(Value::Null);
                let key = value_key(&feed);
                let exists = self
                    .state
                    .publishers
                    .lock()
                    .await
                    .get(&room)
                    .is_some_and(|list| list.iter().any(|p| p.feed.to_string() == key));

                let event = if exists {
                    HandleEvent::Message {
                        data: Some(json!({"videoroom": "attached", "room": room, "id": feed})),
                        jsep: Some(Jsep::offer("v=0 mock-offer")),
                    }
                } else {
                    HandleEvent::Message {
                        data: Some(json!({
                            "videoroom": "event",
                            "error_code": VIDEOROOM_NO_SUCH_FEED,
                            "error": format!("No such feed ({key})"),
                        })),
                        jsep: None,
                    }
                };
                self.state.send(handle, event).await;
            }
            ("publish" | "configure", _) => {
                self.state
                    .send(
                        handle,
                        HandleEvent::Message {
                            data: Some(json!({"videoroom": "event", "configured": "ok"})),
                            jsep: jsep.map(|_| Jsep::answer("v=0 mock-answer")),
                        },
                    )
                    .await;
            }
            ("start", _) => {
                self.state
                    .send(
                        handle,
                        HandleEvent::Message {
                            data: Some(json!({"videoroom": "event", "started": "ok"})),
                            jsep: None,
                        },
                    )
                    .await;
                self.state.send(handle, HandleEvent::WebrtcUp).await;
            }
            ("leave", _) => {
                let (departed, remaining) = {
                    let mut publishers = self.state.publishers.lock().await;
                    let mut departed = None;
                    let mut remaining = Vec::new();
                    // `leave` carries no room; find the publisher by handle
                    for list in publishers.values_mut() {
                        if let Some(feed) = list.iter().find(|p| p.handle == handle).map(|p| p.feed)
                        {
                            departed = Some(feed);
                            list.retain(|p| p.handle != handle);
                            remaining = list.clone();
                            break;
                        }
                    }
                    (departed, remaining)
                };

                self.state
                    .send(
                        handle,
                        HandleEvent::Message {
                            data: Some(json!({"videoroom": "event", "leaving": "ok"})),
                            jsep: None,
                        },
                    )
                    .await;

                if let Some(feed) = departed {
                    for other in remaining {
                        self.state
                            .send(
                                other.handle,
                                HandleEvent::Message {
                                    data: Some(json!({
                                        "videoroom": "event",
                                        "room": room,
                                        "leaving": feed,
                                    })),
                                    jsep: None,
                                },
                            )
                            .await;
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait::async_trait]
impl GatewaySession for MockSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn attach(
        &self,
        plugin: &str,
    ) -> Result<(HandleId, mpsc::Receiver<HandleEvent>), SignalingError> {
        self.ensure_open()?;

        let handle = self.state.next_id();
        let (tx, rx) = mpsc::channel(HANDLE_EVENT_BUFFER);
        self.state.handles.lock().await.insert(handle, tx);
        self.state
            .record(MockRequest::Attach {
                plugin: plugin.to_string(),
                handle,
            })
            .await;

        Ok((handle, rx))
    }

    async fn message(
        &self,
        handle: HandleId,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Result<(), SignalingError> {
        self.ensure_open()?;
        self.state
            .record(MockRequest::Message {
                handle,
                body: body.clone(),
                jsep: jsep.clone(),
            })
            .await;

        if self.state.fail_messages.load(Ordering::SeqCst) {
            return Err(SignalingError::GatewayRequestFailed {
                code: None,
                reason: "scripted message failure".to_string(),
            });
        }

        self.videoroom_message(handle, &body, jsep).await;
        Ok(())
    }

    async fn request(&self, handle: HandleId, body: Value) -> Result<Value, SignalingError> {
        self.ensure_open()?;
        self.state
            .record(MockRequest::Request {
                handle,
                body: body.clone(),
            })
            .await;

        let request = body.get("request").and_then(Value::as_str).unwrap_or("");
        let mut rooms = self.state.rooms.lock().await;

        match request {
            "create" => {
                let room = body
                    .get("room")
                    .map(value_key)
                    .unwrap_or_else(|| self.state.next_id().to_string());
                if !rooms.insert(room.clone()) {
                    return Err(SignalingError::GatewayRequestFailed {
                        code: Some(VIDEOROOM_ROOM_EXISTS),
                        reason: format!("Room {room} already exists"),
                    });
                }
                Ok(json!({"videoroom": "created", "room": room, "permanent": false}))
            }
            "destroy" => {
                let room = body.get("room").map(value_key).unwrap_or_default();
                if rooms.remove(&room) {
                    Ok(json!({"videoroom": "destroyed", "room": room}))
                } else {
                    Err(SignalingError::GatewayRequestFailed {
                        code: Some(VIDEOROOM_NO_SUCH_ROOM),
                        reason: format!("No such room ({room})"),
                    })
                }
            }
            "list" => {
                let list: Vec<Value> = rooms
                    .iter()
                    .map(|room| json!({"room": room, "num_participants": 0}))
                    .collect();
                Ok(json!({"videoroom": "success", "list": list}))
            }
            _ => Ok(json!({"videoroom": "success"})),
        }
    }

    async fn trickle(
        &self,
        handle: HandleId,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.ensure_open()?;
        self.state
            .record(MockRequest::Trickle { handle, candidate })
            .await;
        Ok(())
    }

    async fn detach(&self, handle: HandleId) -> Result<(), SignalingError> {
        self.state.record(MockRequest::Detach { handle }).await;
        self.ensure_open()?;

        match self.state.handles.lock().await.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(SignalingError::GatewayRequestFailed {
                code: None,
                reason: format!("No such handle {handle}"),
            }),
        }
    }

    async fn info(&self) -> Result<(), SignalingError> {
        self.state.record(MockRequest::Info).await;
        self.ensure_open()?;

        if self.state.fail_info.load(Ordering::SeqCst) {
            return Err(SignalingError::GatewayRequestFailed {
                code: None,
                reason: "scripted info failure".to_string(),
            });
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), SignalingError> {
        self.state
            .record(MockRequest::Destroy {
                session_id: self.id,
            })
            .await;
        self.ensure_open()
    }

    async fn close(&self) {
        self.state
            .record(MockRequest::Close {
                session_id: self.id,
            })
            .await;
        self.closed.cancel();
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Room or feed value as a map key; numbers and strings compare alike.
fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
