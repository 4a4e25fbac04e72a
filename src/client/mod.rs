//! The orchestrator tying both adapters together behind one API.
//!
//! One client owns one session at a time. Sessions are identified by a
//! generation counter: every activation bumps it, and every background task
//! (signal routing, fallback timer, health check) carries the generation it
//! was spawned under. A task whose generation is stale finds the session it
//! belonged to already torn down and does nothing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::socket::{SendReceipt, SocketAdapter};
use crate::adapter::streaming::StreamingAdapter;
use crate::adapter::AdapterSignal;
use crate::config::{ConfigUpdate, ConnectionConfig};
use crate::error::ClientError;
use crate::event::{ConnectionState, Protocol, ProtocolSwitch, StateChange, UnifiedEvent};
use crate::listener::{ListenerId, Listeners};
use crate::protocol::ClientMessage;
use crate::stats::{AdapterStats, ConnectionStats, FailureWindow, HealthReport};
use crate::transport::sse::HttpStreamConnector;
use crate::transport::ws::WsSocketConnector;
use crate::transport::{SocketConnector, StreamConnector};

/// Failure lookback used by the health check.
const HEALTH_FAILURE_WINDOW_SECS: i64 = 60;

/// Average latency above this is a degraded connection.
const MAX_HEALTHY_LATENCY_MS: f64 = 5000.0;

/// More than this share of deliveries dropped is a degraded connection.
const MAX_DROP_RATIO: f64 = 0.1;

/// Combined counters for both adapters plus session-level context.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub state: ConnectionState,
    pub active_protocol: Option<Protocol>,
    pub sse: ConnectionStats,
    pub websocket: ConnectionStats,
    pub recent_failures: usize,
    pub protocol_switches: u64,
}

/// Resilient realtime client: connects over the preferred protocol, falls
/// back to the other one, recovers from mid-session failures, and fans
/// events out to registered listeners.
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connectors(
            config,
            Arc::new(HttpStreamConnector::new()),
            Arc::new(WsSocketConnector::new()),
        )
    }

    /// Build against caller-supplied connectors. Tests use this to script
    /// both transports.
    pub fn with_connectors(
        config: ConnectionConfig,
        stream_connector: Arc<dyn StreamConnector>,
        socket_connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let (network_tx, network_rx) = watch::channel(true);
        let stream_stats = Arc::new(AdapterStats::new(Protocol::Sse));
        let socket_stats = Arc::new(AdapterStats::new(Protocol::WebSocket));
        let inner = Arc::new(ClientInner {
            streaming: StreamingAdapter::new(
                stream_connector,
                Arc::clone(&stream_stats),
                network_rx.clone(),
            ),
            socket: SocketAdapter::new(
                socket_connector,
                Arc::clone(&socket_stats),
                network_rx,
            ),
            stream_stats,
            socket_stats,
            config: Mutex::new(config),
            state: Mutex::new(ConnectionState::Disconnected),
            active: Mutex::new(None),
            failures: FailureWindow::default(),
            generation: AtomicU64::new(0),
            want_connected: AtomicBool::new(false),
            protocol_switches: AtomicU64::new(0),
            network_tx,
            op_lock: Mutex::new(()),
            event_listeners: Listeners::new("event"),
            state_listeners: Listeners::new("state_change"),
            switch_listeners: Listeners::new("protocol_switch"),
            routing_task: Mutex::new(None),
            fallback_task: Mutex::new(None),
            health_task: Mutex::new(None),
            network_monitor: Mutex::new(None),
        });
        Self { inner }
    }

    /// Build from `PULSELINK_*` environment variables and the optional
    /// `pulselink` config file.
    pub fn from_env() -> Result<Self, ClientError> {
        Ok(Self::new(ConnectionConfig::from_env()?))
    }

    /// Connect over the preferred protocol, falling back to the other one
    /// when enabled. Returns whether a session is up. Idempotent while a
    /// session is live.
    pub async fn connect(&self) -> bool {
        self.inner.establish().await
    }

    /// Tear the session down. Every pending reconnect, fallback, or health
    /// timer belonging to it is cancelled.
    pub async fn disconnect(&self) {
        self.inner.shutdown().await;
    }

    pub async fn reconnect(&self) -> bool {
        self.inner.shutdown().await;
        self.inner.establish().await
    }

    /// Switch to the given protocol, recording `reason` in the switch
    /// notification. A no-op (and no notification) when it is already the
    /// active one.
    pub async fn switch_protocol(&self, target: Protocol, reason: &str) -> bool {
        self.inner.switch_to(target, reason, None).await
    }

    /// Publish an event to the server. Only supported on WebSocket; while
    /// the session is reconnecting the message is queued and the returned
    /// receipt resolves once it reaches the wire.
    pub async fn send_message(
        &self,
        event_type: &str,
        data: Value,
    ) -> Result<SendReceipt, ClientError> {
        self.inner.publish(event_type, data).await
    }

    /// Measures round-trip latency over the active WebSocket.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let active = *self.inner.active.lock().await;
        match active {
            Some(Protocol::Sse) => Err(ClientError::Unsupported(Protocol::Sse)),
            Some(Protocol::WebSocket) => self.inner.socket.ping().await,
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.lock().await
    }

    pub async fn active_protocol(&self) -> Option<Protocol> {
        *self.inner.active.lock().await
    }

    pub async fn add_event_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&UnifiedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.event_listeners.add(listener).await
    }

    pub async fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.event_listeners.remove(id).await
    }

    pub async fn on_state_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.state_listeners.add(listener).await
    }

    pub async fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.inner.state_listeners.remove(id).await
    }

    pub async fn on_protocol_switch<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProtocolSwitch) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.switch_listeners.add(listener).await
    }

    pub async fn remove_switch_listener(&self, id: ListenerId) -> bool {
        self.inner.switch_listeners.remove(id).await
    }

    pub async fn stats(&self) -> ClientStats {
        ClientStats {
            state: *self.inner.state.lock().await,
            active_protocol: *self.inner.active.lock().await,
            sse: self.inner.stream_stats.snapshot(),
            websocket: self.inner.socket_stats.snapshot(),
            recent_failures: self
                .inner
                .failures
                .recent_count(HEALTH_FAILURE_WINDOW_SECS),
            protocol_switches: self.inner.protocol_switches.load(Ordering::Relaxed),
        }
    }

    pub async fn health(&self) -> HealthReport {
        self.inner.evaluate_health().await.0
    }

    /// Apply a partial config update. When a session is live it is
    /// reconnected so the new settings take effect; the return value is
    /// whether a session is up afterwards.
    pub async fn update_config(&self, update: ConfigUpdate) -> bool {
        {
            let mut config = self.inner.config.lock().await;
            update.apply(&mut config);
        }
        let had_session = self.inner.active.lock().await.is_some();
        info!("configuration updated");
        if had_session {
            self.reconnect().await
        } else {
            false
        }
    }

    pub async fn config(&self) -> ConnectionConfig {
        self.inner.config.lock().await.clone()
    }

    /// Feed external network reachability in. While offline, adapters hold
    /// their reconnect loops; coming back online releases them immediately
    /// with a fresh attempt budget.
    pub fn set_network_available(&self, available: bool) {
        info!(available, "network availability changed");
        let _ = self.inner.network_tx.send(available);
    }

    /// Disconnect and drop every registered listener.
    pub async fn destroy(&self) {
        self.inner.shutdown().await;
        self.inner.event_listeners.clear().await;
        self.inner.state_listeners.clear().await;
        self.inner.switch_listeners.clear().await;
    }
}

struct ClientInner {
    streaming: StreamingAdapter,
    socket: SocketAdapter,
    stream_stats: Arc<AdapterStats>,
    socket_stats: Arc<AdapterStats>,
    config: Mutex<ConnectionConfig>,
    state: Mutex<ConnectionState>,
    active: Mutex<Option<Protocol>>,
    failures: FailureWindow,
    generation: AtomicU64,
    /// Whether the consumer asked for a session. Cleared by `disconnect`,
    /// so an offline-to-online edge only resumes sessions the consumer
    /// still wants.
    want_connected: AtomicBool,
    protocol_switches: AtomicU64,
    network_tx: watch::Sender<bool>,
    /// Serializes connect, disconnect, and switch against each other.
    op_lock: Mutex<()>,
    event_listeners: Listeners<UnifiedEvent>,
    state_listeners: Listeners<StateChange>,
    switch_listeners: Listeners<ProtocolSwitch>,
    routing_task: Mutex<Option<JoinHandle<()>>>,
    fallback_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    network_monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    async fn establish(self: &Arc<Self>) -> bool {
        let _guard = self.op_lock.lock().await;
        self.want_connected.store(true, Ordering::SeqCst);
        self.ensure_network_monitor().await;
        {
            let state = *self.state.lock().await;
            if self.active.lock().await.is_some()
                && matches!(
                    state,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Reconnecting
                )
            {
                debug!("connect called with a live session, ignoring");
                return true;
            }
        }
        self.teardown_active().await;
        let config = self.config.lock().await.clone();

        let preferred = config.preferred_protocol;
        if self.try_activate(preferred, &config).await {
            return true;
        }
        if !config.fallback_enabled {
            self.apply_state(
                ConnectionState::Failed,
                preferred,
                Some("connect failed".to_string()),
            )
            .await;
            return false;
        }

        let fallback = preferred.other();
        self.notify_switch(preferred, fallback, "initial connect failed")
            .await;
        if self.try_activate(fallback, &config).await {
            return true;
        }
        self.apply_state(
            ConnectionState::Failed,
            fallback,
            Some("both protocols failed to connect".to_string()),
        )
        .await;
        false
    }

    async fn shutdown(&self) {
        let _guard = self.op_lock.lock().await;
        self.want_connected.store(false, Ordering::SeqCst);
        let active = *self.active.lock().await;
        let protocol = match active {
            Some(protocol) => protocol,
            None => self.config.lock().await.preferred_protocol,
        };
        self.teardown_active().await;
        self.apply_state(ConnectionState::Disconnected, protocol, None)
            .await;
    }

    /// Activate one protocol: spawn its signal router, dial, and on success
    /// start the periodic health check.
    async fn try_activate(self: &Arc<Self>, protocol: Protocol, config: &ConnectionConfig) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let routing = tokio::spawn(route_signals(
            Arc::downgrade(self),
            generation,
            signal_rx,
            protocol,
        ));
        if let Some(old) = self.routing_task.lock().await.replace(routing) {
            old.abort();
        }

        self.apply_state(ConnectionState::Connecting, protocol, None)
            .await;
        let result = match protocol {
            Protocol::Sse => self.streaming.connect(config.clone(), signal_tx).await,
            Protocol::WebSocket => self.socket.connect(config.clone(), signal_tx).await,
        };
        match result {
            Ok(()) => {
                *self.active.lock().await = Some(protocol);
                self.apply_state(ConnectionState::Connected, protocol, None)
                    .await;
                self.start_health_task(generation, config.health_check_interval_ms)
                    .await;
                true
            }
            Err(e) => {
                warn!(%protocol, error = %e, "connect attempt failed");
                self.failures.record(protocol, e.to_string());
                self.apply_state(
                    ConnectionState::Disconnected,
                    protocol,
                    Some(e.to_string()),
                )
                .await;
                false
            }
        }
    }

    /// Invalidate the current session: no background task spawned before
    /// this point can act afterwards.
    async fn teardown_active(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        for slot in [&self.routing_task, &self.fallback_task, &self.health_task] {
            if let Some(handle) = slot.lock().await.take() {
                handle.abort();
            }
        }
        self.streaming.disconnect().await;
        self.socket.disconnect().await;
        *self.active.lock().await = None;
    }

    // Boxed: the fallback timer awaits a switch, and activating the new
    // session can arm another fallback timer, so a plain `async fn` would
    // give this future a recursively defined type.
    fn switch_to<'a>(
        self: &'a Arc<Self>,
        target: Protocol,
        reason: &'a str,
        expect_generation: Option<u64>,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let _guard = self.op_lock.lock().await;
            if let Some(expected) = expect_generation {
                if self.generation.load(Ordering::SeqCst) != expected {
                    debug!("scheduled switch raced a newer session, skipping");
                    return false;
                }
            }
            let current = *self.active.lock().await;
            if current == Some(target) {
                debug!(%target, "already on the requested protocol");
                return true;
            }
            let from = current.unwrap_or_else(|| target.other());
            let config = self.config.lock().await.clone();
            self.teardown_active().await;
            self.notify_switch(from, target, reason).await;
            if self.try_activate(target, &config).await {
                return true;
            }
            self.apply_state(
                ConnectionState::Failed,
                target,
                Some("switch target failed to connect".to_string()),
            )
            .await;
            false
        })
    }

    async fn publish(&self, event_type: &str, data: Value) -> Result<SendReceipt, ClientError> {
        let active = *self.active.lock().await;
        match active {
            Some(Protocol::Sse) => Err(ClientError::Unsupported(Protocol::Sse)),
            Some(Protocol::WebSocket) => {
                let state = *self.state.lock().await;
                if matches!(
                    state,
                    ConnectionState::Disconnected | ConnectionState::Failed
                ) {
                    return Err(ClientError::NotConnected);
                }
                self.socket
                    .send(ClientMessage::publish(event_type, data))
                    .await
            }
            None => Err(ClientError::NotConnected),
        }
    }

    async fn apply_state(&self, new: ConnectionState, protocol: Protocol, error: Option<String>) {
        {
            let mut state = self.state.lock().await;
            if *state == new {
                return;
            }
            *state = new;
        }
        debug!(state = %new, %protocol, "connection state changed");
        let change = StateChange {
            state: new,
            protocol,
            error,
        };
        let _ = self.state_listeners.notify(&change).await;
    }

    async fn deliver_event(&self, event: UnifiedEvent) {
        let failures = self.event_listeners.notify(&event).await;
        if failures > 0 {
            let stats = self.stats_for(event.protocol);
            for _ in 0..failures {
                stats.record_dropped();
            }
        }
    }

    async fn note_failure(self: &Arc<Self>, protocol: Protocol, reason: String) {
        warn!(%protocol, reason, "connection failure reported");
        self.failures.record(protocol, reason.clone());
        self.schedule_fallback(reason).await;
    }

    async fn notify_switch(&self, from: Protocol, to: Protocol, reason: &str) {
        info!(%from, %to, reason, "switching protocol");
        let _ = self.protocol_switches.fetch_add(1, Ordering::Relaxed);
        let switch = ProtocolSwitch {
            from,
            to,
            reason: reason.to_string(),
        };
        let _ = self.switch_listeners.notify(&switch).await;
    }

    fn stats_for(&self, protocol: Protocol) -> &Arc<AdapterStats> {
        match protocol {
            Protocol::Sse => &self.stream_stats,
            Protocol::WebSocket => &self.socket_stats,
        }
    }

    async fn evaluate_health(&self) -> (HealthReport, bool) {
        let state = *self.state.lock().await;
        let active = *self.active.lock().await;
        let config = self.config.lock().await.clone();
        let protocol = active.unwrap_or(config.preferred_protocol);
        let snapshot = self.stats_for(protocol).snapshot();
        let recent = self.failures.recent_count(HEALTH_FAILURE_WINDOW_SECS);

        let mut issues = Vec::new();
        let mut degraded = false;
        if state != ConnectionState::Connected {
            issues.push(format!("not connected (state: {state})"));
        }
        if recent >= config.failure_threshold {
            issues.push(format!(
                "{recent} connection failures in the last {HEALTH_FAILURE_WINDOW_SECS}s"
            ));
            degraded = true;
        }
        if snapshot.average_latency_ms > MAX_HEALTHY_LATENCY_MS {
            issues.push(format!(
                "average latency {:.0}ms exceeds {MAX_HEALTHY_LATENCY_MS:.0}ms",
                snapshot.average_latency_ms
            ));
            degraded = true;
        }
        if snapshot.events_dropped as f64 > MAX_DROP_RATIO * snapshot.events_received as f64 {
            issues.push(format!(
                "dropped {} of {} received events",
                snapshot.events_dropped, snapshot.events_received
            ));
            degraded = true;
        }

        let report = HealthReport {
            healthy: issues.is_empty(),
            issues,
            state,
            protocol,
            recent_failures: recent,
            average_latency_ms: snapshot.average_latency_ms,
            total_events: snapshot.events_received,
            dropped_events: snapshot.events_dropped,
        };
        (report, degraded)
    }

    /// Arm the fallback timer unless one is already pending. When it fires
    /// it switches to the other protocol, unless the session recovered or
    /// was replaced in the meantime.
    async fn schedule_fallback(self: &Arc<Self>, reason: String) {
        let config = self.config.lock().await.clone();
        if !config.fallback_enabled {
            return;
        }
        // An outage affects both protocols equally; switching is pointless
        // and tearing the session down would lose the resume path.
        if !*self.network_tx.borrow() {
            debug!("offline, not scheduling fallback");
            return;
        }
        let mut slot = self.fallback_task.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("fallback already scheduled");
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let delay = Duration::from_millis(config.fallback_delay_ms);
        let weak = Arc::downgrade(self);
        info!(delay_ms = config.fallback_delay_ms, reason, "scheduling protocol fallback");
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if !*inner.network_tx.borrow() {
                debug!("offline, skipping scheduled fallback");
                return;
            }
            if *inner.state.lock().await == ConnectionState::Connected {
                debug!("connection recovered before fallback fired");
                return;
            }
            let Some(current) = *inner.active.lock().await else {
                return;
            };
            // Detach our own handle so the teardown inside the switch does
            // not abort the task performing it.
            inner.fallback_task.lock().await.take();
            let _ = inner
                .switch_to(current.other(), &reason, Some(generation))
                .await;
        }));
    }

    /// Start the offline-to-online watcher, once per client.
    async fn ensure_network_monitor(self: &Arc<Self>) {
        let mut slot = self.network_monitor.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *slot = Some(spawn_network_monitor(
            Arc::downgrade(self),
            self.network_tx.subscribe(),
        ));
    }

    async fn start_health_task(self: &Arc<Self>, generation: u64, interval_ms: u64) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms);
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let (report, degraded) = inner.evaluate_health().await;
                if !report.healthy {
                    warn!(issues = ?report.issues, "health check found issues");
                }
                if degraded {
                    let reason = report
                        .issues
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "connection degraded".to_string());
                    inner.schedule_fallback(reason).await;
                }
            }
        });
        if let Some(old) = self.health_task.lock().await.replace(task) {
            old.abort();
        }
    }
}

/// Spawns `watch_network` behind a concrete signature so the compiler does
/// not have to resolve the `establish` -> monitor -> `establish` opaque-type
/// cycle while proving the spawned future is `Send`.
fn spawn_network_monitor(
    inner: std::sync::Weak<ClientInner>,
    network: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(watch_network(inner, network))
}

/// Reconnects on the offline-to-online edge.
///
/// Adapters end their session when the network drops, so once connectivity
/// returns nothing else would dial again. Sessions the consumer tore down
/// themselves (`want_connected` cleared) are left alone.
async fn watch_network(inner: std::sync::Weak<ClientInner>, mut network: watch::Receiver<bool>) {
    let mut online = *network.borrow();
    while network.changed().await.is_ok() {
        let was_online = online;
        online = *network.borrow();
        if was_online || !online {
            continue;
        }
        let Some(inner) = inner.upgrade() else { return };
        if !inner.want_connected.load(Ordering::SeqCst) {
            continue;
        }
        let state = *inner.state.lock().await;
        if matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            info!("network restored, reconnecting");
            // Boxed for the same reason as `switch_to`: `establish` spawns
            // this monitor, so neither future type may contain the other.
            let resume: BoxFuture<'_, bool> = Box::pin(inner.establish());
            let _ = resume.await;
        }
    }
}

/// Per-activation signal pump. Exits when the adapter drops its sender or
/// when a newer session supersedes this one.
async fn route_signals(
    inner: std::sync::Weak<ClientInner>,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<AdapterSignal>,
    protocol: Protocol,
) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!(%protocol, "discarding signal from a superseded session");
            return;
        }
        match signal {
            AdapterSignal::State(state, error) => {
                inner.apply_state(state, protocol, error).await;
            }
            AdapterSignal::Event(event) => {
                inner.deliver_event(event).await;
            }
            AdapterSignal::Failure { reason } => {
                inner.note_failure(protocol, reason).await;
            }
        }
    }
}
