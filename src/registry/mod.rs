//! Named registry over multiple clients with a shared health monitor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientStats, RealtimeClient};

/// How often the shared monitor sweeps registered clients.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregate snapshot across every registered client.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RegistrySnapshot {
    pub clients: Vec<NamedStats>,
    pub total_events_received: u64,
    pub total_events_sent: u64,
    pub total_events_dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedStats {
    pub name: String,
    #[serde(flatten)]
    pub stats: ClientStats,
}

/// Holds every live client by name and runs one background sweep that logs
/// health issues. The sweep starts with the first registration and stops
/// when the last client is removed.
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    clients: DashMap<String, Arc<RealtimeClient>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_MONITOR_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clients: DashMap::new(),
                monitor: Mutex::new(None),
                interval,
            }),
        }
    }

    /// Register a client under a name, replacing any previous holder.
    pub async fn register(&self, name: impl Into<String>, client: Arc<RealtimeClient>) {
        let name = name.into();
        info!(name, "registering client");
        self.inner.clients.insert(name, client);
        self.ensure_monitor().await;
    }

    /// Remove and return a client. The monitor stops once the registry is
    /// empty.
    pub async fn unregister(&self, name: &str) -> Option<Arc<RealtimeClient>> {
        let removed = self.inner.clients.remove(name).map(|(_, client)| client);
        if removed.is_some() {
            info!(name, "unregistered client");
        }
        if self.inner.clients.is_empty() {
            if let Some(handle) = self.inner.monitor.lock().await.take() {
                handle.abort();
                debug!("registry monitor stopped");
            }
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<RealtimeClient>> {
        self.inner.clients.get(name).map(|entry| Arc::clone(&entry))
    }

    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Collect stats from every client and roll up the event counters.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let clients: Vec<(String, Arc<RealtimeClient>)> = self
            .inner
            .clients
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut snapshot = RegistrySnapshot::default();
        for (name, client) in clients {
            let stats = client.stats().await;
            snapshot.total_events_received +=
                stats.sse.events_received + stats.websocket.events_received;
            snapshot.total_events_sent += stats.sse.events_sent + stats.websocket.events_sent;
            snapshot.total_events_dropped +=
                stats.sse.events_dropped + stats.websocket.events_dropped;
            snapshot.clients.push(NamedStats { name, stats });
        }
        snapshot.clients.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// Disconnect and drop every client, stopping the monitor.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.monitor.lock().await.take() {
            handle.abort();
        }
        let names = self.names();
        for name in names {
            if let Some((_, client)) = self.inner.clients.remove(&name) {
                client.destroy().await;
            }
        }
        info!("registry shut down");
    }

    async fn ensure_monitor(&self) {
        let mut monitor = self.inner.monitor.lock().await;
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        debug!(interval_secs = interval.as_secs(), "registry monitor started");
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + interval,
                interval,
            );
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                let clients: Vec<(String, Arc<RealtimeClient>)> = inner
                    .clients
                    .iter()
                    .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
                    .collect();
                for (name, client) in clients {
                    let report = client.health().await;
                    if !report.healthy {
                        warn!(name, issues = ?report.issues, "client unhealthy");
                    }
                }
            }
        }));
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
