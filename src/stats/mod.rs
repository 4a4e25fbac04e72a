//! Connection statistics and the failure window feeding health decisions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::event::{ConnectionState, Protocol};

/// Rolling window size for latency samples.
const LATENCY_WINDOW: usize = 100;

/// How long failure records are retained.
const FAILURE_RETENTION_SECS: i64 = 3600;

/// Rolling latency window with a running average.
#[derive(Debug, Default)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
}

impl LatencyWindow {
    pub fn record(&mut self, millis: f64) {
        if self.samples.len() == LATENCY_WINDOW {
            let _ = self.samples.pop_front();
        }
        self.samples.push_back(millis);
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Live counters for one adapter. Shared between the adapter's supervisor
/// task and stats queries, hence atomics plus short-lived mutexes.
#[derive(Debug)]
pub struct AdapterStats {
    protocol: Protocol,
    events_sent: AtomicU64,
    events_received: AtomicU64,
    events_dropped: AtomicU64,
    reconnect_attempts: AtomicU64,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    connection_id: Mutex<Option<String>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    latency: Mutex<LatencyWindow>,
}

impl AdapterStats {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            events_sent: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connected_at: Mutex::new(None),
            connection_id: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
            latency: Mutex::new(LatencyWindow::default()),
        }
    }

    pub fn mark_connected(&self) {
        *self.connected_at.lock().unwrap() = Some(Utc::now());
    }

    pub fn mark_disconnected(&self) {
        *self.connected_at.lock().unwrap() = None;
    }

    /// Capture the server-assigned connection id the first time it appears.
    pub fn set_connection_id(&self, id: &str) {
        let mut slot = self.connection_id.lock().unwrap();
        if slot.is_none() {
            *slot = Some(id.to_string());
        }
    }

    pub fn mark_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Some(Utc::now());
    }

    pub fn record_sent(&self) {
        let _ = self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        let _ = self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        let _ = self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        let _ = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, millis: f64) {
        self.latency.lock().unwrap().record(millis);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            protocol: self.protocol,
            connection_id: self.connection_id.lock().unwrap().clone(),
            connected_at: *self.connected_at.lock().unwrap(),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            average_latency_ms: self.latency.lock().unwrap().average(),
            last_heartbeat: *self.last_heartbeat.lock().unwrap(),
        }
    }
}

/// Point-in-time snapshot of one adapter's counters.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub protocol: Protocol,
    pub connection_id: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub events_sent: u64,
    pub events_received: u64,
    pub events_dropped: u64,
    pub reconnect_attempts: u64,
    pub average_latency_ms: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// One recorded connection failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub reason: String,
}

/// Trailing one-hour failure buffer; the last-60s slice drives health checks.
#[derive(Debug, Default)]
pub struct FailureWindow {
    records: Mutex<VecDeque<FailureRecord>>,
}

impl FailureWindow {
    pub fn record(&self, protocol: Protocol, reason: impl Into<String>) {
        let mut records = self.records.lock().unwrap();
        Self::prune(&mut records);
        records.push_back(FailureRecord {
            timestamp: Utc::now(),
            protocol,
            reason: reason.into(),
        });
    }

    /// Failures recorded within the last `window_secs` seconds.
    pub fn recent_count(&self, window_secs: i64) -> usize {
        let mut records = self.records.lock().unwrap();
        Self::prune(&mut records);
        let cutoff = Utc::now() - ChronoDuration::seconds(window_secs);
        records.iter().filter(|r| r.timestamp > cutoff).count()
    }

    pub fn len(&self) -> usize {
        let mut records = self.records.lock().unwrap();
        Self::prune(&mut records);
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(records: &mut VecDeque<FailureRecord>) {
        let cutoff = Utc::now() - ChronoDuration::seconds(FAILURE_RETENTION_SECS);
        while records
            .front()
            .is_some_and(|r| r.timestamp <= cutoff)
        {
            let _ = records.pop_front();
        }
    }
}

/// Verdict produced by the periodic health check and `RealtimeClient::health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// One human-readable entry per failing condition.
    pub issues: Vec<String>,
    pub state: ConnectionState,
    pub protocol: Protocol,
    pub recent_failures: usize,
    pub average_latency_ms: f64,
    pub total_events: u64,
    pub dropped_events: u64,
}
