//! Signaling Service
//!
//! WebSocket signaling coordinator in front of a Janus video-room gateway.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to the participant store
//! 4. Connect to the gateway (fatal if unreachable)
//! 5. Serve `/ws`, `/health`, `/ready` and `/metrics` on one listener
//! 6. Wait for shutdown signal, drain, close connections, disconnect the gateway

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::secret::ExposeSecret;
use signaling_service::config::Config;
use signaling_service::gateway::{GatewayConnectionManager, JanusConnector};
use signaling_service::observability::metrics::{init_metrics_recorder, spawn_gateway_observer};
use signaling_service::observability::{health_router, HealthState};
use signaling_service::registry::Registry;
use signaling_service::signaling::{signaling_router, AppState};
use signaling_service::store::{ChatContextStore, DisabledAiDispatcher, PgParticipantStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signaling_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Signaling Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        janus_ws_url = %config.janus_ws_url,
        bind_address = %config.bind_address,
        string_ids = config.janus_string_ids,
        connection_timeout_ms = config.connection_timeout_ms,
        health_check_interval_ms = config.health_check_interval_ms,
        reconnect_delay_ms = config.reconnect_delay_ms,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    info!("Connecting to participant store...");
    let store = PgParticipantStore::connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to participant store");
            e
        })?;
    info!("Participant store connected");

    let shutdown_token = CancellationToken::new();

    let gateway = GatewayConnectionManager::new(
        config.gateway_settings(),
        Arc::new(JanusConnector::new(config.gateway_settings())),
    );
    let observer = spawn_gateway_observer(gateway.subscribe(), shutdown_token.child_token());

    // Unreachable at startup is fatal; afterwards the manager reconnects
    info!(url = %config.janus_ws_url, "Connecting to gateway...");
    gateway.connect().await.map_err(|e| {
        error!(error = %e, "Failed to connect to gateway");
        e
    })?;
    info!("Gateway connected");

    let chat_context = Arc::new(ChatContextStore::new());
    let connections = TaskTracker::new();
    let state = AppState {
        registry: Registry::new(),
        gateway: gateway.clone(),
        store: Arc::new(store),
        room_state: chat_context.clone(),
        ai: Arc::new(DisabledAiDispatcher),
        chat_context,
        shutdown: shutdown_token.child_token(),
        connections: connections.clone(),
    };

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = signaling_router(state)
        .merge(health_router(Arc::clone(&health_state), gateway.clone()))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind listener");
        format!("Failed to bind {addr}: {e}")
    })?;

    let server_token = shutdown_token.child_token();
    let server = tokio::spawn(async move {
        info!(addr = %addr, "Signaling server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("Signaling server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!(addr = %addr, "Signaling Service running - press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    if config.drain_seconds > 0 {
        info!(
            drain_seconds = config.drain_seconds,
            "Draining before shutdown"
        );
        tokio::time::sleep(Duration::from_secs(config.drain_seconds)).await;
    }

    // Closes every signaling connection, then the listener
    shutdown_token.cancel();
    if let Err(e) = server.await {
        error!(error = %e, "Signaling server task failed");
    }

    // Upgraded sockets outlive the server future; let each one leave its
    // room and persist its status before the gateway session goes away
    connections.close();
    info!(
        open_connections = connections.len(),
        "Waiting for signaling connections to close"
    );
    connections.wait().await;

    gateway.disconnect().await;
    observer.abort();

    info!("Signaling Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
