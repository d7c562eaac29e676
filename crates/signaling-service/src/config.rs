//! Signaling service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::gateway::GatewaySettings;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default gateway control-plane WebSocket URL.
pub const DEFAULT_JANUS_WS_URL: &str = "ws://localhost:8188/janus";

/// Default bind address for the signaling WebSocket and HTTP endpoints.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default bound on waiting for the gateway connection, in milliseconds.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;

/// Default gateway health-check interval, in milliseconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

/// Default fixed delay before a reconnect attempt, in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Default session keepalive interval, in milliseconds.
///
/// Must stay below the gateway's session timeout (60s by default).
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 25_000;

/// Default bound on a single gateway request/response, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default drain period after a shutdown signal, in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 0;

/// Signaling service configuration.
///
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Participant store connection URL.
    /// Protected by `SecretString` because it embeds credentials.
    pub database_url: SecretString,

    /// Gateway WebSocket URL (default: `ws://localhost:8188/janus`).
    pub janus_ws_url: String,

    /// Optional `apisecret` attached to every gateway request.
    pub janus_api_secret: Option<SecretString>,

    /// Optional `admin_key` for room create/destroy/list.
    pub janus_admin_key: Option<SecretString>,

    /// Whether rooms are created with string IDs (default: true).
    pub janus_string_ids: bool,

    /// Signaling listener bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// Bound on `wait_until_connected`, in milliseconds.
    pub connection_timeout_ms: u64,

    /// Gateway health-check interval, in milliseconds.
    pub health_check_interval_ms: u64,

    /// Fixed reconnect delay, in milliseconds.
    pub reconnect_delay_ms: u64,

    /// Session keepalive interval, in milliseconds.
    pub keepalive_interval_ms: u64,

    /// Bound on a single gateway transaction, in milliseconds.
    pub request_timeout_ms: u64,

    /// Drain period after the shutdown signal, in seconds.
    pub drain_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("janus_ws_url", &self.janus_ws_url)
            .field(
                "janus_api_secret",
                &self.janus_api_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "janus_admin_key",
                &self.janus_admin_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("janus_string_ids", &self.janus_string_ids)
            .field("bind_address", &self.bind_address)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("health_check_interval_ms", &self.health_check_interval_ms)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("keepalive_interval_ms", &self.keepalive_interval_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("drain_seconds", &self.drain_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = SecretString::from(
            vars.get("DATABASE_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
                .clone(),
        );

        let janus_ws_url = vars
            .get("JANUS_WS_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_JANUS_WS_URL.to_string());

        if !(janus_ws_url.starts_with("ws://") || janus_ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "JANUS_WS_URL must use ws:// or wss://, got {janus_ws_url}"
            )));
        }

        let janus_api_secret = non_empty(vars, "JANUS_API_SECRET").map(SecretString::from);
        let janus_admin_key = non_empty(vars, "JANUS_ADMIN_KEY").map(SecretString::from);

        let janus_string_ids = match vars.get("JANUS_STRING_IDS").map(String::as_str) {
            None | Some("true" | "1") => true,
            Some("false" | "0") => false,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "JANUS_STRING_IDS must be true or false, got {other}"
                )))
            }
        };

        let bind_address = vars
            .get("SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let connection_timeout_ms = parse_millis(
            vars,
            "GATEWAY_CONNECTION_TIMEOUT_MS",
            DEFAULT_CONNECTION_TIMEOUT_MS,
        )?;
        let health_check_interval_ms = parse_millis(
            vars,
            "GATEWAY_HEALTH_CHECK_INTERVAL_MS",
            DEFAULT_HEALTH_CHECK_INTERVAL_MS,
        )?;
        let reconnect_delay_ms =
            parse_millis(vars, "GATEWAY_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)?;
        let keepalive_interval_ms = parse_millis(
            vars,
            "GATEWAY_KEEPALIVE_INTERVAL_MS",
            DEFAULT_KEEPALIVE_INTERVAL_MS,
        )?;
        let request_timeout_ms =
            parse_millis(vars, "GATEWAY_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;

        let drain_seconds = vars
            .get("SIGNALING_DRAIN_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DRAIN_SECONDS);

        Ok(Config {
            database_url,
            janus_ws_url,
            janus_api_secret,
            janus_admin_key,
            janus_string_ids,
            bind_address,
            connection_timeout_ms,
            health_check_interval_ms,
            reconnect_delay_ms,
            keepalive_interval_ms,
            request_timeout_ms,
            drain_seconds,
        })
    }

    /// Gateway connection settings derived from this configuration.
    #[must_use]
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            url: self.janus_ws_url.clone(),
            api_secret: self.janus_api_secret.clone(),
            admin_key: self.janus_admin_key.clone(),
            string_ids: self.janus_string_ids,
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse_millis(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };

    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue(format!("{key} must be positive"))),
        Ok(value) => Ok(value),
        Err(e) => Err(ConfigError::InvalidValue(format!("{key}={raw}: {e}"))),
    }
}
