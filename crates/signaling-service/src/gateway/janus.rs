//! Janus WebSocket transport.
//!
//! One WebSocket per control session. A writer task drains an outbound
//! channel into the socket, a reader task resolves pending transactions and
//! routes asynchronous events to per-handle channels, and a keepalive task
//! keeps the session from expiring on the gateway.

use super::manager::GatewaySettings;
use super::protocol::{GatewayMessage, HandleId, IceCandidate, Jsep, SessionId, SUBPROTOCOL};
use super::transport::{
    plugin_error, GatewayConnector, GatewaySession, HandleEvent, HANDLE_EVENT_BUFFER,
};
use crate::errors::SignalingError;
use crate::observability::metrics;

use common::secret::{ExposeSecret, SecretString};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingReply = oneshot::Sender<GatewayMessage>;

/// Capacity of the outbound frame channel.
const OUTBOUND_BUFFER: usize = 256;

/// Length of generated transaction IDs.
const TRANSACTION_LEN: usize = 12;

/// Connector that opens a Janus WebSocket transport per session.
pub struct JanusConnector {
    settings: GatewaySettings,
}

impl JanusConnector {
    #[must_use]
    pub fn new(settings: GatewaySettings) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl GatewayConnector for JanusConnector {
    async fn connect(&self) -> Result<Arc<dyn GatewaySession>, SignalingError> {
        let session = JanusSession::connect(&self.settings).await?;
        Ok(session)
    }
}

/// State shared by the reader task and the request path.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<String, PendingReply>>,
    handles: Mutex<HashMap<HandleId, mpsc::Sender<HandleEvent>>>,
    closed: CancellationToken,
}

/// Request side of the transport.
#[derive(Clone)]
struct JanusClient {
    outbound: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    api_secret: Option<SecretString>,
    request_timeout: Duration,
}

impl JanusClient {
    /// Send one request and wait for the reply carrying its transaction.
    async fn transact(&self, mut request: Value) -> Result<GatewayMessage, SignalingError> {
        let kind = request
            .get("janus")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let transaction = new_transaction();

        if let Value::Object(map) = &mut request {
            map.insert("transaction".to_string(), Value::from(transaction.clone()));
            if let Some(secret) = &self.api_secret {
                map.insert(
                    "apisecret".to_string(),
                    Value::from(secret.expose_secret()),
                );
            }
        }

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(transaction.clone(), tx);

        let started = Instant::now();

        if self
            .outbound
            .send(Message::Text(request.to_string()))
            .await
            .is_err()
        {
            self.shared.pending.lock().await.remove(&transaction);
            return Err(SignalingError::GatewayUnreachable(
                "gateway transport closed".to_string(),
            ));
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(SignalingError::GatewayUnreachable(
                    "gateway transport closed".to_string(),
                ))
            }
            Err(_) => {
                self.shared.pending.lock().await.remove(&transaction);
                metrics::record_gateway_request(&kind, "timeout", started.elapsed());
                return Err(SignalingError::GatewayRequestFailed {
                    code: None,
                    reason: format!("{kind} request timed out"),
                });
            }
        };

        if let GatewayMessage::Error { error, .. } = reply {
            metrics::record_gateway_request(&kind, "error", started.elapsed());
            return Err(SignalingError::GatewayRequestFailed {
                code: Some(error.code),
                reason: error.reason,
            });
        }

        metrics::record_gateway_request(&kind, "success", started.elapsed());
        Ok(reply)
    }
}

/// A Janus control session over its own WebSocket.
pub struct JanusSession {
    session_id: SessionId,
    client: JanusClient,
}

impl JanusSession {
    /// Open the WebSocket, create a session and start the background tasks.
    #[instrument(skip_all, name = "signal.gateway.connect", fields(url = %settings.url))]
    pub async fn connect(settings: &GatewaySettings) -> Result<Arc<Self>, SignalingError> {
        let mut request = settings
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SignalingError::GatewayUnreachable(format!("invalid gateway URL: {e}")))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );

        let (ws, _response) = tokio::time::timeout(settings.connection_timeout, connect_async(request))
            .await
            .map_err(|_| {
                SignalingError::GatewayUnreachable("timed out connecting to gateway".to_string())
            })?
            .map_err(|e| SignalingError::GatewayUnreachable(format!("connect failed: {e}")))?;

        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let shared = Arc::new(Shared::default());

        tokio::spawn(write_loop(sink, outbound_rx, shared.closed.clone()));
        tokio::spawn(read_loop(stream, Arc::clone(&shared)));

        let client = JanusClient {
            outbound,
            shared: Arc::clone(&shared),
            api_secret: settings.api_secret.clone(),
            request_timeout: settings.request_timeout,
        };

        let session_id = match client.transact(json!({"janus": "create"})).await {
            Ok(GatewayMessage::Success {
                data: Some(data), ..
            }) => data.id,
            Ok(other) => {
                shared.closed.cancel();
                return Err(SignalingError::GatewayUnreachable(format!(
                    "unexpected reply to session create: {other:?}"
                )));
            }
            Err(e) => {
                shared.closed.cancel();
                return Err(SignalingError::GatewayUnreachable(format!(
                    "session create failed: {e}"
                )));
            }
        };

        tokio::spawn(keepalive_loop(
            client.clone(),
            session_id,
            settings.keepalive_interval,
        ));

        info!(
            target: "signal.gateway",
            session_id = session_id,
            "Gateway session created"
        );

        Ok(Arc::new(Self { session_id, client }))
    }

    async fn handle_request(
        &self,
        janus: &str,
        handle: HandleId,
        extra: Value,
    ) -> Result<GatewayMessage, SignalingError> {
        let mut request = json!({
            "janus": janus,
            "session_id": self.session_id,
            "handle_id": handle,
        });
        if let (Value::Object(map), Value::Object(extra)) = (&mut request, extra) {
            map.extend(extra);
        }
        self.client.transact(request).await
    }
}

#[async_trait::async_trait]
impl GatewaySession for JanusSession {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn attach(
        &self,
        plugin: &str,
    ) -> Result<(HandleId, mpsc::Receiver<HandleEvent>), SignalingError> {
        let reply = self
            .client
            .transact(json!({
                "janus": "attach",
                "session_id": self.session_id,
                "plugin": plugin,
            }))
            .await?;

        let GatewayMessage::Success {
            data: Some(data), ..
        } = reply
        else {
            return Err(SignalingError::GatewayRequestFailed {
                code: None,
                reason: "attach reply carried no handle".to_string(),
            });
        };

        let (tx, rx) = mpsc::channel(HANDLE_EVENT_BUFFER);
        self.client.shared.handles.lock().await.insert(data.id, tx);

        debug!(
            target: "signal.gateway",
            session_id = self.session_id,
            handle_id = data.id,
            plugin = plugin,
            "Plugin handle attached"
        );

        Ok((data.id, rx))
    }

    async fn message(
        &self,
        handle: HandleId,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Result<(), SignalingError> {
        let mut extra = json!({ "body": body });
        if let (Value::Object(map), Some(jsep)) = (&mut extra, jsep) {
            let jsep = serde_json::to_value(jsep)
                .map_err(|e| SignalingError::Internal(format!("jsep encode failed: {e}")))?;
            map.insert("jsep".to_string(), jsep);
        }

        match self.handle_request("message", handle, extra).await? {
            GatewayMessage::Success {
                plugindata: Some(plugindata),
                ..
            } => match plugin_error(&plugindata.data) {
                Some(err) => Err(err),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    async fn request(&self, handle: HandleId, body: Value) -> Result<Value, SignalingError> {
        match self
            .handle_request("message", handle, json!({ "body": body }))
            .await?
        {
            GatewayMessage::Success {
                plugindata: Some(plugindata),
                ..
            } => match plugin_error(&plugindata.data) {
                Some(err) => Err(err),
                None => Ok(plugindata.data),
            },
            other => Err(SignalingError::GatewayRequestFailed {
                code: None,
                reason: format!("unexpected reply to plugin request: {other:?}"),
            }),
        }
    }

    async fn trickle(
        &self,
        handle: HandleId,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let candidate = serde_json::to_value(candidate)
            .map_err(|e| SignalingError::Internal(format!("candidate encode failed: {e}")))?;
        self.handle_request("trickle", handle, json!({ "candidate": candidate }))
            .await
            .map(|_| ())
    }

    async fn detach(&self, handle: HandleId) -> Result<(), SignalingError> {
        let result = self.handle_request("detach", handle, json!({})).await;
        self.client.shared.handles.lock().await.remove(&handle);
        result.map(|_| ())
    }

    async fn info(&self) -> Result<(), SignalingError> {
        self.client
            .transact(json!({"janus": "info"}))
            .await
            .map(|_| ())
    }

    async fn destroy(&self) -> Result<(), SignalingError> {
        self.client
            .transact(json!({"janus": "destroy", "session_id": self.session_id}))
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        self.client.shared.closed.cancel();
    }

    fn closed(&self) -> CancellationToken {
        self.client.shared.closed.clone()
    }
}

fn new_transaction() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TRANSACTION_LEN)
        .map(char::from)
        .collect()
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    warn!(target: "signal.gateway", error = %e, "Gateway write failed");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    closed.cancel();
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            () = shared.closed.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(&shared, &text).await,
                Some(Ok(Message::Close(frame))) => {
                    info!(target: "signal.gateway", frame = ?frame, "Gateway closed the transport");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(target: "signal.gateway", error = %e, "Gateway transport error");
                    break;
                }
                None => break,
            }
        }
    }

    shared.closed.cancel();
    // Dropping the senders fails every waiter and ends every handle stream.
    shared.pending.lock().await.clear();
    shared.handles.lock().await.clear();
}

async fn dispatch(shared: &Shared, text: &str) {
    let message: GatewayMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(target: "signal.gateway", error = %e, "Unparseable gateway message");
            return;
        }
    };

    // Plugin events echo the transaction of the request that caused them,
    // but that request already resolved on its ack.
    if !matches!(message, GatewayMessage::Event { .. }) {
        if let Some(transaction) = message.transaction() {
            if let Some(waiter) = shared.pending.lock().await.remove(transaction) {
                let _ = waiter.send(message);
                return;
            }
        }
    }

    let (sender, event) = match message {
        GatewayMessage::Event {
            sender,
            plugindata,
            jsep,
            ..
        } => (
            sender,
            HandleEvent::Message {
                data: plugindata.map(|p| p.data),
                jsep,
            },
        ),
        GatewayMessage::Webrtcup { sender } => (sender, HandleEvent::WebrtcUp),
        GatewayMessage::Media {
            sender,
            kind,
            receiving,
        } => (
            sender,
            HandleEvent::Media {
                kind,
                receiving: receiving.unwrap_or(false),
            },
        ),
        GatewayMessage::Slowlink { sender, uplink } => (sender, HandleEvent::SlowLink { uplink }),
        GatewayMessage::Hangup { sender, reason } => (sender, HandleEvent::Hangup { reason }),
        GatewayMessage::Detached { sender } => (sender, HandleEvent::Detached),
        GatewayMessage::Trickle { sender, candidate } => {
            (sender, HandleEvent::Candidate(candidate))
        }
        GatewayMessage::Timeout { session_id } => {
            warn!(target: "signal.gateway", session_id = session_id, "Gateway session timed out");
            shared.closed.cancel();
            return;
        }
        other => {
            debug!(target: "signal.gateway", message = ?other, "Ignoring gateway message");
            return;
        }
    };

    let detached = matches!(event, HandleEvent::Detached);
    let mut handles = shared.handles.lock().await;

    match handles.get(&sender) {
        Some(tx) => {
            if let Err(e) = tx.try_send(event) {
                warn!(
                    target: "signal.gateway",
                    handle_id = sender,
                    error = %e,
                    "Dropping handle event"
                );
            }
        }
        None => {
            debug!(target: "signal.gateway", handle_id = sender, "Event for unknown handle");
        }
    }

    if detached {
        handles.remove(&sender);
    }
}

async fn keepalive_loop(client: JanusClient, session_id: SessionId, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = client.shared.closed.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = client
                    .transact(json!({"janus": "keepalive", "session_id": session_id}))
                    .await
                {
                    debug!(target: "signal.gateway", session_id = session_id, error = %e, "Keepalive failed");
                }
            }
        }
    }
}
