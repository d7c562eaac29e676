//! Test server harness for E2E testing
//!
//! Provides `TestSignalingServer` for spawning the real signaling and
//! health routes on a random port, backed by the in-memory participant
//! store and either the in-process `MockGateway` or a `MockJanusServer`.

use crate::fixtures::TestParticipant;
use crate::mock_janus::MockJanusServer;

use axum::Router;
use signaling_service::gateway::mock::MockGateway;
use signaling_service::gateway::{GatewayConnectionManager, GatewaySettings, JanusConnector};
use signaling_service::observability::{health_router, HealthState};
use signaling_service::registry::Registry;
use signaling_service::signaling::{signaling_router, AppState};
use signaling_service::store::{ChatContextStore, DisabledAiDispatcher, MemoryParticipantStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Gateway settings with timings short enough for tests.
#[must_use]
pub fn fast_gateway_settings(url: &str) -> GatewaySettings {
    GatewaySettings {
        url: url.to_string(),
        connection_timeout: Duration::from_secs(2),
        health_check_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
        ..GatewaySettings::default()
    }
}

/// Test harness for spawning the signaling service in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_join_e2e() -> Result<()> {
///     let (server, _gateway) = TestSignalingServer::with_mock_gateway().await?;
///     let alice = TestParticipant::new("alice");
///     alice.issue(server.store()).await;
///
///     let mut client = SignalingClient::connect(&server.ws_url(Some(&alice.token))).await?;
///     client.recv_type("connection-ready").await;
///     Ok(())
/// }
/// ```
pub struct TestSignalingServer {
    addr: SocketAddr,
    state: AppState,
    store: MemoryParticipantStore,
    chat_context: Arc<ChatContextStore>,
    health: Arc<HealthState>,
    _handle: JoinHandle<()>,
}

impl TestSignalingServer {
    /// Spawn a server in front of an already-connected gateway manager.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    pub async fn spawn(gateway: GatewayConnectionManager) -> Result<Self, anyhow::Error> {
        let store = MemoryParticipantStore::new();
        let chat_context = Arc::new(ChatContextStore::new());
        let health = Arc::new(HealthState::new());

        let state = AppState {
            registry: Registry::new(),
            gateway: gateway.clone(),
            store: Arc::new(store.clone()),
            room_state: chat_context.clone(),
            ai: Arc::new(DisabledAiDispatcher),
            chat_context: chat_context.clone(),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        };

        let app: Router = signaling_router(state.clone())
            .merge(health_router(Arc::clone(&health), gateway));

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let shutdown = state.shutdown.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });

        health.set_ready();

        Ok(Self {
            addr,
            state,
            store,
            chat_context,
            health,
            _handle: handle,
        })
    }

    /// Spawn a server backed by a connected in-process `MockGateway`.
    pub async fn with_mock_gateway() -> Result<(Self, MockGateway), anyhow::Error> {
        let mock = MockGateway::new();
        let gateway =
            GatewayConnectionManager::new(fast_gateway_settings("ws://mock"), mock.connector());
        gateway
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("Mock gateway connect failed: {}", e))?;

        let server = Self::spawn(gateway).await?;
        Ok((server, mock))
    }

    /// Spawn a server talking to `janus` over a real WebSocket.
    pub async fn with_janus(janus: &MockJanusServer) -> Result<Self, anyhow::Error> {
        let settings = fast_gateway_settings(&janus.url());
        let gateway = GatewayConnectionManager::new(
            settings.clone(),
            Arc::new(JanusConnector::new(settings)),
        );
        gateway
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("Janus connect failed: {}", e))?;

        Self::spawn(gateway).await
    }

    /// Issue a join token for `participant` and return its record ID.
    pub async fn admit(&self, participant: &TestParticipant) -> Uuid {
        participant.issue(&self.store).await
    }

    /// Signaling URL, with `?token=` when a token is given.
    #[must_use]
    pub fn ws_url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws?token={}", self.addr, token),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    /// Get the base URL of the test server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn store(&self) -> &MemoryParticipantStore {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    #[must_use]
    pub fn gateway(&self) -> &GatewayConnectionManager {
        &self.state.gateway
    }

    #[must_use]
    pub fn chat_context(&self) -> &ChatContextStore {
        &self.chat_context
    }

    #[must_use]
    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Close every signaling connection and stop the listener.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Shut down like the service binary does: close every connection and
    /// wait until each has finished its teardown.
    pub async fn shutdown_and_wait(&self) {
        self.state.shutdown.cancel();
        self.state.connections.close();
        self.state.connections.wait().await;
    }
}

impl Drop for TestSignalingServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        self._handle.abort();
    }
}
