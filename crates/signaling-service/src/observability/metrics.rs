//! Metrics definitions for the signaling service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `signal_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: success, failure, error, timeout
//! - `request`: gateway request kinds (~10 values)
//! - `message_type`: inbound signaling message types (~8 values)
//! - `reason`: connection rejection reasons (2 values)

use crate::gateway::GatewayEvent;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("signal_gateway_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set gateway request buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `signal_gateway_connected` (1 while a control session is up).
pub fn set_gateway_connected(connected: bool) {
    gauge!("signal_gateway_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Metric: `signal_connections_active`.
pub fn connection_opened() {
    gauge!("signal_connections_active").increment(1.0);
}

/// Metric: `signal_connections_active`.
pub fn connection_closed() {
    gauge!("signal_connections_active").decrement(1.0);
}

/// Metric: `signal_rooms_active`.
pub fn set_rooms_active(count: usize) {
    // usize to f64 is exact for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("signal_rooms_active").set(count as f64);
}

// ============================================================================
// Gateway
// ============================================================================

/// Metric: `signal_gateway_reconnects_total{outcome}`.
pub fn record_gateway_reconnect(outcome: &str) {
    counter!("signal_gateway_reconnects_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Metric: `signal_gateway_health_checks_total{outcome}`.
pub fn record_gateway_health_check(outcome: &str) {
    counter!("signal_gateway_health_checks_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Metric: `signal_gateway_request_duration_seconds{request, outcome}`.
pub fn record_gateway_request(request: &str, outcome: &str, duration: Duration) {
    histogram!("signal_gateway_request_duration_seconds",
        "request" => request.to_string(),
        "outcome" => outcome.to_string()
    )
    .record(duration.as_secs_f64());
}

// ============================================================================
// Signaling
// ============================================================================

/// Metric: `signal_messages_total{message_type}`.
pub fn record_message(message_type: &str) {
    counter!("signal_messages_total",
        "message_type" => message_type.to_string()
    )
    .increment(1);
}

/// Metric: `signal_connections_rejected_total{reason}`.
pub fn record_connection_rejected(reason: &str) {
    counter!("signal_connections_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Spawn the observer that turns gateway connection events into metrics.
pub fn spawn_gateway_observer(
    mut events: broadcast::Receiver<GatewayEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(GatewayEvent::Connected) => set_gateway_connected(true),
                    Ok(GatewayEvent::Disconnected) => set_gateway_connected(false),
                    Ok(GatewayEvent::Reconnected) => record_gateway_reconnect("success"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "signal.gateway", skipped = skipped, "Gateway observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        debug!(target: "signal.gateway", "Gateway observer stopped");
    })
}
