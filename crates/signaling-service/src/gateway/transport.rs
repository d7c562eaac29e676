//! Transport seam between the connection manager and the gateway.
//!
//! `GatewayConnector` opens a transport and creates a control session;
//! `GatewaySession` is the control session every plugin handle is opened
//! on. The production implementation lives in [`super::janus`]; tests use
//! [`super::mock::MockGateway`].

use super::protocol::{HandleId, IceCandidate, Jsep};
use crate::errors::SignalingError;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of each plugin handle's event channel.
pub const HANDLE_EVENT_BUFFER: usize = 64;

/// Asynchronous event delivered to one plugin handle.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleEvent {
    /// Plugin event: plugin payload and/or JSEP.
    Message {
        data: Option<Value>,
        jsep: Option<Jsep>,
    },
    /// PeerConnection is up.
    WebrtcUp,
    /// Media started or stopped flowing.
    Media {
        kind: Option<String>,
        receiving: bool,
    },
    /// Gateway reports packet loss on this handle.
    SlowLink { uplink: bool },
    /// PeerConnection closed.
    Hangup { reason: Option<String> },
    /// Handle detached on the gateway side.
    Detached,
    /// Trickled ICE candidate from the gateway.
    Candidate(IceCandidate),
}

/// Opens a transport to the gateway and creates a control session on it.
#[async_trait::async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Connect and create a session.
    ///
    /// Fails with `GatewayUnreachable` if either step fails.
    async fn connect(&self) -> Result<Arc<dyn GatewaySession>, SignalingError>;
}

/// A live control session on the gateway.
#[async_trait::async_trait]
pub trait GatewaySession: Send + Sync {
    /// Gateway-assigned session ID.
    fn session_id(&self) -> u64;

    /// Attach a plugin handle. Events for the handle arrive on the receiver
    /// until the handle detaches or the transport closes.
    async fn attach(
        &self,
        plugin: &str,
    ) -> Result<(HandleId, mpsc::Receiver<HandleEvent>), SignalingError>;

    /// Send an asynchronous plugin message; resolves once the gateway acks.
    async fn message(
        &self,
        handle: HandleId,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Result<(), SignalingError>;

    /// Send a synchronous plugin request and return `plugindata.data`.
    ///
    /// Plugin-level errors (`error_code`/`error`) map to `GatewayRequestFailed`.
    async fn request(&self, handle: HandleId, body: Value) -> Result<Value, SignalingError>;

    /// Trickle an ICE candidate on a handle.
    async fn trickle(&self, handle: HandleId, candidate: IceCandidate)
        -> Result<(), SignalingError>;

    /// Detach a plugin handle.
    async fn detach(&self, handle: HandleId) -> Result<(), SignalingError>;

    /// Lightweight status request used by the health check.
    async fn info(&self) -> Result<(), SignalingError>;

    /// Destroy the control session.
    async fn destroy(&self) -> Result<(), SignalingError>;

    /// Close the underlying transport.
    async fn close(&self);

    /// Token cancelled when the transport reports close or error.
    fn closed(&self) -> CancellationToken;
}

/// Map a videoroom plugin payload carrying `error_code`/`error` to an error.
pub(crate) fn plugin_error(data: &Value) -> Option<SignalingError> {
    let code = data.get("error_code").and_then(Value::as_i64);
    let reason = data.get("error").and_then(Value::as_str);

    if code.is_none() && reason.is_none() {
        return None;
    }

    Some(SignalingError::GatewayRequestFailed {
        code,
        reason: reason.unwrap_or("plugin error").to_string(),
    })
}
