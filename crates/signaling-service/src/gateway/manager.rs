//! Gateway Connection Manager.
//!
//! Process-wide owner of the gateway control session:
//!
//! - Connects once at startup (failure is fatal to the caller)
//! - Watches the transport and reconnects after a fixed delay, forever
//! - Runs a periodic health check on the live session
//! - Serves room create/destroy/list over short-lived plugin handles
//!
//! # Reconnect collapsing
//!
//! A transport close and a failed health check can fire together. Both go
//! through [`GatewayConnectionManager::schedule_reconnect`], which flips the
//! `reconnecting` flag under the watch channel's lock; only the caller that
//! flipped it spawns the reconnect loop.

use super::protocol::{room_value, RoomDetails, VideoRoomData, VIDEOROOM_PLUGIN};
use super::transport::{GatewayConnector, GatewaySession};
use crate::config::{
    DEFAULT_CONNECTION_TIMEOUT_MS, DEFAULT_HEALTH_CHECK_INTERVAL_MS, DEFAULT_JANUS_WS_URL,
    DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_REQUEST_TIMEOUT_MS,
};
use crate::errors::SignalingError;
use crate::observability::metrics;

use common::secret::{ExposeSecret, SecretString};
use common::types::RoomId;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of the manager event broadcast channel.
const EVENT_BUFFER: usize = 16;

/// Default publisher limit for rooms created without one.
pub const DEFAULT_MAX_PUBLISHERS: u32 = 6;

/// Gateway connection settings.
#[derive(Clone)]
pub struct GatewaySettings {
    pub url: String,
    pub api_secret: Option<SecretString>,
    pub admin_key: Option<SecretString>,
    pub string_ids: bool,
    pub connection_timeout: Duration,
    pub health_check_interval: Duration,
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_JANUS_WS_URL.to_string(),
            api_secret: None,
            admin_key: None,
            string_ids: true,
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl fmt::Debug for GatewaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySettings")
            .field("url", &self.url)
            .field("api_secret", &self.api_secret.as_ref().map(|_| "[REDACTED]"))
            .field("admin_key", &self.admin_key.as_ref().map(|_| "[REDACTED]"))
            .field("string_ids", &self.string_ids)
            .field("connection_timeout", &self.connection_timeout)
            .field("health_check_interval", &self.health_check_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Events emitted for external observers (metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A control session came up.
    Connected,
    /// A reconnect cycle completed.
    Reconnected,
    /// The live control session went away.
    Disconnected,
}

/// Snapshot of the manager's connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub has_session: bool,
    pub reconnecting: bool,
}

/// Options for [`GatewayConnectionManager::create_room`].
#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// Reserved room ID; generated when absent.
    pub room: Option<RoomId>,
    pub description: Option<String>,
    pub max_publishers: u32,
    pub pin: Option<String>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            room: None,
            description: None,
            max_publishers: DEFAULT_MAX_PUBLISHERS,
            pin: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LinkState {
    connected: bool,
    reconnecting: bool,
}

impl LinkState {
    fn usable(self) -> bool {
        self.connected && !self.reconnecting
    }
}

struct ActiveConnection {
    session: Arc<dyn GatewaySession>,
    /// Stops the transport watcher and health check of this session.
    cancel: CancellationToken,
}

struct Inner {
    settings: GatewaySettings,
    connector: Arc<dyn GatewayConnector>,
    active: RwLock<Option<ActiveConnection>>,
    link: watch::Sender<LinkState>,
    events: broadcast::Sender<GatewayEvent>,
    shutdown: CancellationToken,
}

/// Handle to the process-wide gateway connection.
#[derive(Clone)]
pub struct GatewayConnectionManager {
    inner: Arc<Inner>,
}

impl GatewayConnectionManager {
    /// Create a manager. Nothing connects until [`Self::connect`].
    #[must_use]
    pub fn new(settings: GatewaySettings, connector: Arc<dyn GatewayConnector>) -> Self {
        let (link, _) = watch::channel(LinkState::default());
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                active: RwLock::new(None),
                link,
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Establish the transport and control session.
    ///
    /// # Errors
    ///
    /// `GatewayUnreachable` if the transport connect or session create fails.
    #[instrument(skip_all, name = "signal.gateway.connect_session")]
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let session = self.inner.connector.connect().await.map_err(|e| match e {
            SignalingError::GatewayUnreachable(_) => e,
            other => SignalingError::GatewayUnreachable(other.to_string()),
        })?;

        let cancel = self.inner.shutdown.child_token();
        let previous = self.inner.active.write().await.replace(ActiveConnection {
            session: Arc::clone(&session),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        self.inner.link.send_modify(|link| link.connected = true);
        let _ = self.inner.events.send(GatewayEvent::Connected);

        info!(
            target: "signal.gateway",
            session_id = session.session_id(),
            "Gateway connected"
        );

        tokio::spawn(self.clone().watch_transport(Arc::clone(&session), cancel.clone()));
        tokio::spawn(self.clone().health_check_loop(session, cancel));

        Ok(())
    }

    /// Wait for a usable connection.
    ///
    /// Returns at once when connected. While a reconnect is pending the
    /// wait covers its outcome, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// `ConnectionTimeout` if no connection comes up within `timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), SignalingError> {
        let mut link = self.inner.link.subscribe();
        if link.borrow().usable() {
            return Ok(());
        }

        let outcome = tokio::time::timeout(timeout, link.wait_for(|state| state.usable()))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SignalingError::Internal(format!(
                "connection state channel closed: {e}"
            ))),
            Err(_) => Err(SignalingError::ConnectionTimeout),
        }
    }

    /// Current control session.
    ///
    /// # Errors
    ///
    /// `GatewayUnreachable` when no live session exists.
    pub async fn session(&self) -> Result<Arc<dyn GatewaySession>, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::GatewayUnreachable(
                "gateway is not connected".to_string(),
            ));
        }

        self.inner
            .active
            .read()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.session))
            .ok_or_else(|| {
                SignalingError::GatewayUnreachable("no active gateway session".to_string())
            })
    }

    /// Subscribe to connection events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.link.borrow().connected
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        let link = *self.inner.link.borrow();
        ConnectionStatus {
            connected: link.connected,
            has_session: self.inner.active.read().await.is_some(),
            reconnecting: link.reconnecting,
        }
    }

    /// Whether room IDs travel as strings.
    #[must_use]
    pub fn string_ids(&self) -> bool {
        self.inner.settings.string_ids
    }

    #[must_use]
    pub fn settings(&self) -> &GatewaySettings {
        &self.inner.settings
    }

    /// Create a videoroom and return its ID.
    ///
    /// # Errors
    ///
    /// `ConnectionTimeout` or `GatewayRequestFailed`.
    pub async fn create_room(&self, options: RoomOptions) -> Result<RoomId, SignalingError> {
        let string_ids = self.string_ids();
        let room = options
            .room
            .or_else(|| string_ids.then(RoomId::generate));

        let mut body = json!({
            "request": "create",
            "publishers": options.max_publishers,
            "is_private": false,
        });
        if let Value::Object(map) = &mut body {
            if let Some(room) = &room {
                map.insert("room".to_string(), room_value(room, string_ids));
            }
            if let Some(description) = options.description {
                map.insert("description".to_string(), Value::from(description));
            }
            if let Some(pin) = options.pin {
                map.insert("pin".to_string(), Value::from(pin));
            }
        }

        let data = self.room_request(self.with_admin_key(body)).await?;
        let created = VideoRoomData::from_value(&data)
            .room
            .or(room)
            .ok_or_else(|| SignalingError::GatewayRequestFailed {
                code: None,
                reason: "create reply carried no room".to_string(),
            })?;

        info!(target: "signal.gateway", room_id = %created, "Room created");
        Ok(created)
    }

    /// Destroy a videoroom. A room the gateway does not know is a success.
    ///
    /// # Errors
    ///
    /// `ConnectionTimeout` or `GatewayRequestFailed` other than "no such room".
    pub async fn destroy_room(&self, room: &RoomId) -> Result<(), SignalingError> {
        let body = json!({
            "request": "destroy",
            "room": room_value(room, self.string_ids()),
        });

        match self.room_request(self.with_admin_key(body)).await {
            Ok(_) => {
                info!(target: "signal.gateway", room_id = %room, "Room destroyed");
                Ok(())
            }
            Err(e) if e.is_room_not_found() => {
                info!(
                    target: "signal.gateway",
                    room_id = %room,
                    "Room already absent at gateway"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Look up a videoroom in the gateway's room list.
    ///
    /// # Errors
    ///
    /// `ConnectionTimeout` or `GatewayRequestFailed`.
    pub async fn get_room_details(
        &self,
        room: &RoomId,
    ) -> Result<Option<RoomDetails>, SignalingError> {
        let data = self
            .room_request(self.with_admin_key(json!({"request": "list"})))
            .await?;

        Ok(VideoRoomData::from_value(&data)
            .list
            .unwrap_or_default()
            .into_iter()
            .find(|details| details.room == *room))
    }

    /// Stop health checks and reconnects, destroy the session and close the
    /// transport. Errors are swallowed.
    pub async fn disconnect(&self) {
        self.inner.shutdown.cancel();
        self.teardown_active().await;
        self.inner.link.send_modify(|link| link.reconnecting = false);
        info!(target: "signal.gateway", "Gateway disconnected");
    }

    /// Schedule a reconnect cycle unless one is already pending or running.
    fn schedule_reconnect(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let scheduled = self.inner.link.send_if_modified(|link| {
            if link.reconnecting {
                false
            } else {
                link.reconnecting = true;
                true
            }
        });

        if !scheduled {
            debug!(target: "signal.gateway", "Reconnect already pending");
            return;
        }

        info!(
            target: "signal.gateway",
            delay_ms = self.inner.settings.reconnect_delay.as_millis(),
            "Scheduling gateway reconnect"
        );
        tokio::spawn(self.clone().reconnect_loop());
    }

    #[instrument(skip_all, name = "signal.gateway.reconnect")]
    async fn reconnect_loop(self) {
        let delay = self.inner.settings.reconnect_delay;
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => {
                    debug!(target: "signal.gateway", "Reconnect abandoned on shutdown");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            attempt = attempt.saturating_add(1);
            self.teardown_active().await;

            match self.connect().await {
                Ok(()) => {
                    self.inner
                        .link
                        .send_modify(|link| link.reconnecting = false);
                    let _ = self.inner.events.send(GatewayEvent::Reconnected);
                    info!(target: "signal.gateway", attempt = attempt, "Gateway reconnected");

                    // The new transport may already have dropped while the
                    // flag was still set; its watcher's request collapsed.
                    if !self.is_connected() {
                        self.schedule_reconnect();
                    }
                    return;
                }
                Err(e) => {
                    metrics::record_gateway_reconnect("failure");
                    warn!(
                        target: "signal.gateway",
                        attempt = attempt,
                        error = %e,
                        "Gateway reconnect attempt failed"
                    );
                }
            }
        }
    }

    /// Take the active session and tear it down best-effort.
    async fn teardown_active(&self) {
        let previous = self.inner.active.write().await.take();
        self.mark_disconnected();

        let Some(previous) = previous else {
            return;
        };
        previous.cancel.cancel();

        if let Err(e) = previous.session.destroy().await {
            debug!(
                target: "signal.gateway",
                error = %e,
                "Ignoring session destroy failure during teardown"
            );
        }
        previous.session.close().await;
    }

    fn mark_disconnected(&self) {
        let was_connected = self.inner.link.send_if_modified(|link| {
            let was = link.connected;
            link.connected = false;
            was
        });

        if was_connected {
            let _ = self.inner.events.send(GatewayEvent::Disconnected);
        }
    }

    async fn watch_transport(self, session: Arc<dyn GatewaySession>, cancel: CancellationToken) {
        let closed = session.closed();

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = closed.cancelled() => {}
        }

        warn!(
            target: "signal.gateway",
            session_id = session.session_id(),
            "Gateway transport closed"
        );
        self.mark_disconnected();
        self.schedule_reconnect();
    }

    #[instrument(skip_all, name = "signal.gateway.health_check")]
    async fn health_check_loop(self, session: Arc<dyn GatewaySession>, cancel: CancellationToken) {
        let period = self.inner.settings.health_check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match session.info().await {
                        Ok(()) => metrics::record_gateway_health_check("success"),
                        Err(e) => {
                            metrics::record_gateway_health_check("failure");
                            warn!(
                                target: "signal.gateway",
                                session_id = session.session_id(),
                                error = %e,
                                "Gateway health check failed"
                            );
                            self.mark_disconnected();
                            self.schedule_reconnect();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Run one synchronous videoroom request on a short-lived handle.
    async fn room_request(&self, body: Value) -> Result<Value, SignalingError> {
        self.wait_until_connected(self.inner.settings.connection_timeout)
            .await?;
        let session = self.session().await?;

        let (handle, _events) = session.attach(VIDEOROOM_PLUGIN).await?;
        let result = session.request(handle, body).await;

        if let Err(e) = session.detach(handle).await {
            debug!(
                target: "signal.gateway",
                handle_id = handle,
                error = %e,
                "Ignoring detach failure of room handle"
            );
        }

        result
    }

    fn with_admin_key(&self, mut body: Value) -> Value {
        if let (Value::Object(map), Some(key)) = (&mut body, &self.inner.settings.admin_key) {
            map.insert("admin_key".to_string(), Value::from(key.expose_secret()));
        }
        body
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::gateway::mock::{MockGateway, MockRequest};

    fn fast_settings() -> GatewaySettings {
        GatewaySettings {
            connection_timeout: Duration::from_millis(200),
            health_check_interval: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(1),
            ..GatewaySettings::default()
        }
    }

    fn manager(mock: &MockGateway) -> GatewayConnectionManager {
        GatewayConnectionManager::new(fast_settings(), mock.connector())
    }

    fn count_events(rx: &mut broadcast::Receiver<GatewayEvent>, wanted: GatewayEvent) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if event == wanted {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_connect_emits_connected() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        let mut events = manager.subscribe();

        manager.connect().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(events.try_recv().unwrap(), GatewayEvent::Connected);
        let status = manager.connection_status().await;
        assert!(status.connected && status.has_session && !status.reconnecting);
    }

    #[tokio::test]
    async fn test_connect_failure_is_gateway_unreachable() {
        let mock = MockGateway::new();
        mock.fail_next_connects(1);
        let manager = manager(&mock);

        let result = manager.connect().await;
        assert!(matches!(result, Err(SignalingError::GatewayUnreachable(_))));
        assert!(!manager.is_connected());
        assert!(manager.session().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_connected_times_out() {
        let mock = MockGateway::new();
        let manager = manager(&mock);

        let result = manager
            .wait_until_connected(Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(SignalingError::ConnectionTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_connected_resolves_on_connect() {
        let mock = MockGateway::new();
        let manager = manager(&mock);

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_until_connected(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.connect().await.unwrap();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_room_lifecycle_detaches_every_handle() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        manager.connect().await.unwrap();

        let room = manager
            .create_room(RoomOptions {
                room: Some(RoomId::new("R1")),
                ..RoomOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(room, RoomId::new("R1"));

        let details = manager.get_room_details(&room).await.unwrap();
        assert_eq!(details.map(|d| d.room), Some(RoomId::new("R1")));

        manager.destroy_room(&room).await.unwrap();
        assert!(manager.get_room_details(&room).await.unwrap().is_none());

        let requests = mock.requests().await;
        let attaches = requests
            .iter()
            .filter(|r| matches!(r, MockRequest::Attach { .. }))
            .count();
        let detaches = requests
            .iter()
            .filter(|r| matches!(r, MockRequest::Detach { .. }))
            .count();
        assert_eq!(attaches, 4);
        assert_eq!(detaches, 4);
    }

    #[tokio::test]
    async fn test_generated_room_ids_are_unique() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        manager.connect().await.unwrap();

        let a = manager.create_room(RoomOptions::default()).await.unwrap();
        let b = manager.create_room(RoomOptions::default()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_destroy_missing_room_is_success() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        manager.connect().await.unwrap();

        let result = manager.destroy_room(&RoomId::new("never-created")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_create_duplicate_room_fails() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        manager.connect().await.unwrap();

        let options = RoomOptions {
            room: Some(RoomId::new("dup")),
            ..RoomOptions::default()
        };
        manager.create_room(options.clone()).await.unwrap();
        let result = manager.create_room(options).await;
        assert!(matches!(
            result,
            Err(SignalingError::GatewayRequestFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_and_health_failure_collapse_into_one_reconnect() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        let mut events = manager.subscribe();
        manager.connect().await.unwrap();

        mock.set_info_failure(true);
        mock.close_current().await;

        // Health check fires at 500ms while the reconnect waits for 1s.
        tokio::time::sleep(Duration::from_millis(750)).await;
        mock.set_info_failure(false);
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(mock.connect_count(), 2);
        assert!(manager.is_connected());
        assert_eq!(count_events(&mut events, GatewayEvent::Reconnected), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_until_success() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        let mut events = manager.subscribe();
        manager.connect().await.unwrap();

        mock.fail_next_connects(2);
        mock.close_current().await;

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(mock.connect_count(), 4);
        assert!(manager.is_connected());
        assert_eq!(count_events(&mut events, GatewayEvent::Reconnected), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_covers_pending_reconnect() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        manager.connect().await.unwrap();

        mock.close_current().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = manager.wait_until_connected(Duration::from_secs(3)).await;
        assert!(result.is_ok());
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_health_check_marks_disconnected_before_reconnect() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        let mut events = manager.subscribe();
        manager.connect().await.unwrap();
        let _ = events.try_recv();

        mock.set_info_failure(true);
        // Health check fires at 500ms; the reconnect waits a further 1s.
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(!manager.is_connected());
        assert!(manager.session().await.is_err());
        assert_eq!(events.try_recv().unwrap(), GatewayEvent::Disconnected);
        assert_eq!(mock.connect_count(), 1);

        mock.set_info_failure(false);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(manager.is_connected());
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnects() {
        let mock = MockGateway::new();
        let manager = manager(&mock);
        manager.connect().await.unwrap();

        manager.disconnect().await;
        assert!(!manager.is_connected());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mock.connect_count(), 1);

        let requests = mock.requests().await;
        assert!(requests.iter().any(|r| matches!(r, MockRequest::Destroy { .. })));
        assert!(requests.iter().any(|r| matches!(r, MockRequest::Close { .. })));
    }
}
