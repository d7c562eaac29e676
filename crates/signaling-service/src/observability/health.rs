//! Health endpoints for the signaling service.
//!
//! - `GET /health` - Liveness probe, `{"status":"ok","timestamp":...}`
//! - `GET /ready` - Readiness probe (not draining and the gateway link is up)
//!
//! The `/metrics` endpoint is served separately via `metrics-exporter-prometheus`.

use crate::gateway::GatewayConnectionManager;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health state for the signaling service.
///
/// `ready` is cleared when shutdown starts so load balancers stop routing
/// new connections while existing ones drain.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProbeState {
    health: Arc<HealthState>,
    gateway: GatewayConnectionManager,
}

/// Liveness response body.
#[derive(Debug, Serialize)]
pub struct LivenessBody {
    pub status: &'static str,
    pub timestamp: String,
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>, gateway: GatewayConnectionManager) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(ProbeState {
            health: health_state,
            gateway,
        })
}

async fn liveness_handler(State(state): State<ProbeState>) -> (StatusCode, Json<LivenessBody>) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    if state.health.is_live() {
        (
            StatusCode::OK,
            Json(LivenessBody {
                status: "ok",
                timestamp,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(LivenessBody {
                status: "unavailable",
                timestamp,
            }),
        )
    }
}

async fn readiness_handler(State(state): State<ProbeState>) -> StatusCode {
    if state.health.is_ready() && state.gateway.is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
