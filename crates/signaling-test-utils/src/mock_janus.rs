//! Mock Janus gateway over a real WebSocket.
//!
//! `MockJanusServer` listens on `127.0.0.1:0` and speaks enough of the
//! Janus core and videoroom protocols to drive `JanusConnector` end to end:
//!
//! - `create`, `attach`, `detach`, `destroy`, `keepalive`, `info`, `trickle`
//! - videoroom `create`, `destroy`, `list` (synchronous, `success` replies)
//! - videoroom `join`, `publish`, `configure`, `start`, `leave` (`ack` then
//!   an asynchronous `event` addressed to the handle)
//!
//! # Example
//!
//! ```rust,ignore
//! use signaling_test_utils::MockJanusServer;
//!
//! let janus = MockJanusServer::start().await;
//! let settings = GatewaySettings { url: janus.url(), ..GatewaySettings::default() };
//! let manager = GatewayConnectionManager::new(settings.clone(), Arc::new(JanusConnector::new(settings)));
//! manager.connect().await.unwrap();
//!
//! janus.disconnect_all().await; // Exercise the reconnect loop
//! ```

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const SUBPROTOCOL: &str = "janus-protocol";
const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// Videoroom error codes.
const NO_SUCH_ROOM: i64 = 426;
const ROOM_EXISTS: i64 = 427;
const NO_SUCH_FEED: i64 = 428;

/// Janus core error for an unknown request.
const UNKNOWN_REQUEST: i64 = 453;

#[derive(Debug, Clone)]
struct Publisher {
    feed: u64,
    handle: u64,
    display: Option<String>,
}

#[derive(Default)]
struct ServerState {
    next_id: AtomicU64,
    connections: AtomicUsize,
    fail_info: AtomicBool,
    requests: Mutex<Vec<Value>>,
    rooms: Mutex<HashSet<String>>,
    publishers: Mutex<HashMap<String, Vec<Publisher>>>,
    /// Handle ID to the outbound channel of the connection that owns it.
    handles: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    /// Cancelled by `disconnect_all`; replaced after each use.
    kick: Mutex<CancellationToken>,
}

impl ServerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn event(&self, handle: u64, data: Value, jsep: Option<Value>) {
        let mut frame = json!({
            "janus": "event",
            "sender": handle,
            "plugindata": {"plugin": VIDEOROOM_PLUGIN, "data": data},
        });
        if let Some(jsep) = jsep {
            frame["jsep"] = jsep;
        }
        self.push(handle, frame).await;
    }

    async fn push(&self, handle: u64, frame: Value) {
        let sender = self.handles.lock().await.get(&handle).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(frame.to_string()).await;
        }
    }
}

/// Mock Janus gateway listening on a local port.
pub struct MockJanusServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    _handle: JoinHandle<()>,
}

impl MockJanusServer {
    /// Bind to a random port and start accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock Janus server");
        let addr = listener.local_addr().expect("Failed to read local address");

        let state = Arc::new(ServerState::default());
        let shutdown = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let state = Arc::clone(&accept_state);
                        let kick = state.kick.lock().await.clone();
                        let shutdown = accept_shutdown.clone();
                        tokio::spawn(serve_connection(stream, state, kick, shutdown));
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown,
            _handle: handle,
        }
    }

    /// WebSocket URL of the server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close every open connection. New connections are still accepted.
    pub async fn disconnect_all(&self) {
        let mut kick = self.state.kick.lock().await;
        kick.cancel();
        *kick = CancellationToken::new();
    }

    /// Make `info` requests fail until reset.
    pub fn set_info_failure(&self, fail: bool) {
        self.state.fail_info.store(fail, Ordering::SeqCst);
    }

    /// Every request received, in order.
    pub async fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().await.clone()
    }

    /// Number of requests whose `janus` field equals `kind`.
    pub async fn request_count(&self, kind: &str) -> usize {
        self.state
            .requests
            .lock()
            .await
            .iter()
            .filter(|r| r.get("janus").and_then(Value::as_str) == Some(kind))
            .count()
    }

    /// Number of videoroom requests (`body.request`) equal to `request`.
    pub async fn plugin_request_count(&self, request: &str) -> usize {
        self.state
            .requests
            .lock()
            .await
            .iter()
            .filter(|r| r["body"]["request"].as_str() == Some(request))
            .count()
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

impl Drop for MockJanusServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self._handle.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    kick: CancellationToken,
    shutdown: CancellationToken,
) {
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, echo_subprotocol).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(256);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut owned_handles = Vec::new();

    loop {
        tokio::select! {
            () = kick.cancelled() => break,
            () = shutdown.cancelled() => break,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else { continue };
                    state.requests.lock().await.push(request.clone());
                    if let Some(handle) = handle_request(&state, &outbound, request).await {
                        owned_handles.push(handle);
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    // A dead session takes its handles and publishers with it
    {
        let mut handles = state.handles.lock().await;
        for handle in &owned_handles {
            handles.remove(handle);
        }
    }
    {
        let mut publishers = state.publishers.lock().await;
        for list in publishers.values_mut() {
            list.retain(|p| !owned_handles.contains(&p.handle));
        }
    }

    drop(outbound);
    writer.abort();
}

/// The client refuses a handshake that does not echo its subprotocol.
#[allow(clippy::result_large_err)]
fn echo_subprotocol(_request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    response.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SUBPROTOCOL),
    );
    Ok(response)
}

/// Answer one request. Returns the handle ID if the request attached one.
async fn handle_request(
    state: &ServerState,
    outbound: &mpsc::Sender<String>,
    request: Value,
) -> Option<u64> {
    let transaction = request.get("transaction").cloned().unwrap_or(Value::Null);
    let kind = request.get("janus").and_then(Value::as_str).unwrap_or("");
    let handle = request.get("handle_id").and_then(Value::as_u64).unwrap_or(0);

    let reply = |frame: Value| {
        let outbound = outbound.clone();
        async move {
            let _ = outbound.send(frame.to_string()).await;
        }
    };

    match kind {
        "create" => {
            let id = state.next_id();
            reply(json!({"janus": "success", "transaction": transaction, "data": {"id": id}}))
                .await;
        }
        "attach" => {
            let id = state.next_id();
            state.handles.lock().await.insert(id, outbound.clone());
            reply(json!({"janus": "success", "transaction": transaction, "data": {"id": id}}))
                .await;
            return Some(id);
        }
        "detach" => {
            let known = state.handles.lock().await.remove(&handle).is_some();
            if known {
                reply(json!({"janus": "success", "transaction": transaction})).await;
                let _ = outbound
                    .send(json!({"janus": "detached", "sender": handle}).to_string())
                    .await;
            } else {
                reply(json!({
                    "janus": "error",
                    "transaction": transaction,
                    "error": {"code": 459, "reason": format!("No such handle {handle}")},
                }))
                .await;
            }
        }
        "keepalive" | "trickle" => {
            reply(json!({"janus": "ack", "transaction": transaction})).await;
        }
        "info" => {
            if state.fail_info.load(Ordering::SeqCst) {
                reply(json!({
                    "janus": "error",
                    "transaction": transaction,
                    "error": {"code": 490, "reason": "scripted info failure"},
                }))
                .await;
            } else {
                reply(json!({
                    "janus": "server_info",
                    "transaction": transaction,
                    "name": "Mock Janus",
                }))
                .await;
            }
        }
        "destroy" => {
            reply(json!({"janus": "success", "transaction": transaction})).await;
        }
        "message" => {
            let body = request.get("body").cloned().unwrap_or(Value::Null);
            let jsep = request.get("jsep").cloned();
            match body.get("request").and_then(Value::as_str).unwrap_or("") {
                "create" | "destroy" | "list" | "exists" => {
                    let data = room_request(state, &body).await;
                    reply(json!({
                        "janus": "success",
                        "transaction": transaction,
                        "sender": handle,
                        "plugindata": {"plugin": VIDEOROOM_PLUGIN, "data": data},
                    }))
                    .await;
                }
                _ => {
                    reply(json!({"janus": "ack", "transaction": transaction})).await;
                    videoroom_event(state, handle, &body, jsep).await;
                }
            }
        }
        other => {
            reply(json!({
                "janus": "error",
                "transaction": transaction,
                "error": {"code": UNKNOWN_REQUEST, "reason": format!("Unknown request '{other}'")},
            }))
            .await;
        }
    }

    None
}

async fn room_request(state: &ServerState, body: &Value) -> Value {
    let mut rooms = state.rooms.lock().await;

    match body.get("request").and_then(Value::as_str).unwrap_or("") {
        "create" => {
            let room = body
                .get("room")
                .map(value_key)
                .unwrap_or_else(|| state.next_id().to_string());
            if rooms.insert(room.clone()) {
                json!({"videoroom": "created", "room": room, "permanent": false})
            } else {
                json!({
                    "videoroom": "event",
                    "error_code": ROOM_EXISTS,
                    "error": format!("Room {room} already exists"),
                })
            }
        }
        "destroy" => {
            let room = body.get("room").map(value_key).unwrap_or_default();
            if rooms.remove(&room) {
                json!({"videoroom": "destroyed", "room": room})
            } else {
                json!({
                    "videoroom": "event",
                    "error_code": NO_SUCH_ROOM,
                    "error": format!("No such room ({room})"),
                })
            }
        }
        "exists" => {
            let room = body.get("room").map(value_key).unwrap_or_default();
            json!({"videoroom": "success", "room": room, "exists": rooms.contains(&room)})
        }
        _ => {
            let list: Vec<Value> = rooms
                .iter()
                .map(|room| json!({"room": room, "num_participants": 0, "max_publishers": 16}))
                .collect();
            json!({"videoroom": "success", "list": list})
        }
    }
}

async fn videoroom_event(state: &ServerState, handle: u64, body: &Value, jsep: Option<Value>) {
    let request = body.get("request").and_then(Value::as_str).unwrap_or("");
    let room = body.get("room").map(value_key).unwrap_or_default();
    let answer = || json!({"type": "answer", "sdp": "v=0 mock-janus-answer"});

    match (request, body.get("ptype").and_then(Value::as_str)) {
        ("join", Some("publisher")) => {
            let feed = state.next_id();
            let display = body
                .get("display")
                .and_then(Value::as_str)
                .map(str::to_string);

            let others = {
                let mut publishers = state.publishers.lock().await;
                let list = publishers.entry(room.clone()).or_default();
                let others = list.clone();
                list.push(Publisher {
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
            state
                .event(
                    handle,
                    json!({"videoroom": "joined", "room": room, "id": feed, "publishers": listed}),
                    jsep.map(|_| answer()),
                )
                .await;

            for other in others {
                state
                    .event(
                        other.handle,
                        json!({
                            "videoroom": "event",
                            "room": room,
                            "publishers": [{"id": feed, "display": display}],
                        }),
                        None,
                    )
                    .await;
            }
        }
        ("join", Some("subscriber")) => {
            let feed = body.get("feed").cloned().unwrap_or(Value::Null);
            let key = value_key(&feed);
            let exists = state
                .publishers
                .lock()
                .await
                .get(&room)
                .is_some_and(|list| list.iter().any(|p| p.feed.to_string() == key));

            if exists {
                state
                    .event(
                        handle,
                        json!({"videoroom": "attached", "room": room, "id": feed}),
                        Some(json!({"type": "offer", "sdp": "v=0 mock-janus-offer"})),
                    )
                    .await;
            } else {
                state
                    .event(
                        handle,
                        json!({
                            "videoroom": "event",
                            "error_code": NO_SUCH_FEED,
                            "error": format!("No such feed ({key})"),
                        }),
                        None,
                    )
                    .await;
            }
        }
        ("publish" | "configure", _) => {
            state
                .event(
                    handle,
                    json!({"videoroom": "event", "configured": "ok"}),
                    jsep.map(|_| answer()),
                )
                .await;
        }
        ("start", _) => {
            state
                .event(handle, json!({"videoroom": "event", "started": "ok"}), None)
                .await;
            state
                .push(handle, json!({"janus": "webrtcup", "sender": handle}))
                .await;
        }
        ("leave", _) => {
            let (departed, remaining) = {
                let mut publishers = state.publishers.lock().await;
                let mut found = None;
                for (room, list) in publishers.iter_mut() {
                    if let Some(feed) = list.iter().find(|p| p.handle == handle).map(|p| p.feed) {
                        list.retain(|p| p.handle != handle);
                        found = Some((feed, room.clone(), list.clone()));
                        break;
                    }
                }
                match found {
                    Some((feed, room, remaining)) => (Some((feed, room)), remaining),
                    None => (None, Vec::new()),
                }
            };

            state
                .event(handle, json!({"videoroom": "event", "leaving": "ok"}), None)
                .await;

            if let Some((feed, room)) = departed {
                for other in remaining {
                    state
                        .event(
                            other.handle,
                            json!({"videoroom": "event", "room": room, "leaving": feed}),
                            None,
                        )
                        .await;
                }
            }
        }
        _ => {}
    }
}

/// Room or feed value as a map key; numbers and strings compare alike.
fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
