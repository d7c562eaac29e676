//! Signaling service error types.
//!
//! Error types map to the string codes carried by outbound `error` messages
//! and, for join-token failures, to the reserved WebSocket close codes.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// Close code sent when the connection request carries no join token.
pub const CLOSE_MISSING_TOKEN: u16 = 4001;

/// Close code sent when the join token is unknown or already consumed.
pub const CLOSE_INVALID_TOKEN: u16 = 4002;

/// Videoroom plugin error code for "no such room".
pub const VIDEOROOM_NO_SUCH_ROOM: i64 = 426;

/// Signaling service error type.
///
/// Maps to client-facing codes:
/// - `MissingJoinToken` / `InvalidJoinToken`: close codes 4001 / 4002
/// - `NotAttached`: `NOT_ATTACHED`
/// - `MessageProcessing`: `MESSAGE_PROCESSING_ERROR`
/// - Gateway errors: `GATEWAY_UNAVAILABLE` / `GATEWAY_REQUEST_FAILED`
/// - Store, Config, Internal: `INTERNAL_ERROR`
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Transport connect or session create against the gateway failed.
    #[error("Gateway unreachable: {0}")]
    GatewayUnreachable(String),

    /// Timed out waiting for the gateway connection to come up.
    #[error("Timed out waiting for gateway connection")]
    ConnectionTimeout,

    /// The gateway rejected a request.
    #[error("Gateway request failed: {reason}")]
    GatewayRequestFailed { code: Option<i64>, reason: String },

    /// Connection request carried no join token.
    #[error("Join token is required")]
    MissingJoinToken,

    /// Join token unknown or already consumed.
    #[error("Invalid join token")]
    InvalidJoinToken,

    /// Operation needs a plugin handle that is not attached.
    #[error("Plugin handle not attached")]
    NotAttached,

    /// An inbound client message could not be processed.
    #[error("Message processing error: {0}")]
    MessageProcessing(String),

    /// Participant store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Reserved WebSocket close code, for errors that refuse a connection.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            SignalingError::MissingJoinToken => Some(CLOSE_MISSING_TOKEN),
            SignalingError::InvalidJoinToken => Some(CLOSE_INVALID_TOKEN),
            _ => None,
        }
    }

    /// Returns the code carried by an outbound `error` message.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SignalingError::GatewayUnreachable(_) | SignalingError::ConnectionTimeout => {
                "GATEWAY_UNAVAILABLE"
            }
            SignalingError::GatewayRequestFailed { .. } => "GATEWAY_REQUEST_FAILED",
            SignalingError::MissingJoinToken => "MISSING_JOIN_TOKEN",
            SignalingError::InvalidJoinToken => "INVALID_JOIN_TOKEN",
            SignalingError::NotAttached => "NOT_ATTACHED",
            SignalingError::MessageProcessing(_) => "MESSAGE_PROCESSING_ERROR",
            SignalingError::Store(_) | SignalingError::Config(_) | SignalingError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::GatewayUnreachable(_) | SignalingError::ConnectionTimeout => {
                "Media gateway is unavailable".to_string()
            }
            SignalingError::GatewayRequestFailed { reason, .. } => reason.clone(),
            SignalingError::MissingJoinToken => "Join token is required.".to_string(),
            SignalingError::InvalidJoinToken => "Invalid join token.".to_string(),
            SignalingError::NotAttached => "Media session is not ready".to_string(),
            SignalingError::MessageProcessing(msg) => msg.clone(),
            SignalingError::Store(_) | SignalingError::Config(_) | SignalingError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// True when the gateway reported that the addressed room does not exist.
    #[must_use]
    pub fn is_room_not_found(&self) -> bool {
        matches!(
            self,
            SignalingError::GatewayRequestFailed {
                code: Some(VIDEOROOM_NO_SUCH_ROOM),
                ..
            }
        )
    }
}

impl From<sqlx::Error> for SignalingError {
    fn from(err: sqlx::Error) -> Self {
        SignalingError::Store(err.to_string())
    }
}
