//! Unified event model shared by both transports.
//!
//! Whatever wire the event arrived on, consumers only ever see a
//! [`UnifiedEvent`] and a [`ConnectionState`]; adapter internals never leak.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire protocol an event was delivered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// One-way server-sent event stream.
    Sse,
    /// Bidirectional WebSocket connection.
    #[serde(rename = "websocket")]
    WebSocket,
}

impl Protocol {
    /// The alternate protocol, used for fallback switching.
    pub fn other(self) -> Self {
        match self {
            Protocol::Sse => Protocol::WebSocket,
            Protocol::WebSocket => Protocol::Sse,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Sse => write!(f, "sse"),
            Protocol::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Consumer-visible connection state.
///
/// Single source of truth: each adapter's internal lifecycle is mapped into
/// this enum before it reaches application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Event priority, integer-coded on the wire (1=low .. 4=critical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl From<EventPriority> for u8 {
    fn from(p: EventPriority) -> u8 {
        match p {
            EventPriority::Low => 1,
            EventPriority::Normal => 2,
            EventPriority::High => 3,
            EventPriority::Critical => 4,
        }
    }
}

impl TryFrom<u8> for EventPriority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(EventPriority::Low),
            2 => Ok(EventPriority::Normal),
            3 => Ok(EventPriority::High),
            4 => Ok(EventPriority::Critical),
            other => Err(format!("invalid priority value: {other}")),
        }
    }
}

/// Normalized event record delivered to consumers regardless of transport.
///
/// Produced per inbound frame/message and handed to listeners; the
/// communication layer does not retain it.
#[derive(Debug, Clone, Serialize)]
pub struct UnifiedEvent {
    /// Server-assigned event id, when present.
    pub id: Option<String>,
    /// Event type tag (e.g. `agent_status`, `task_update`).
    pub event_type: String,
    /// Opaque payload; domain interpretation belongs to the consumer.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Which transport delivered this event.
    pub protocol: Protocol,
    pub priority: Option<EventPriority>,
}

/// Notification payload for state-change listeners.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub state: ConnectionState,
    pub protocol: Protocol,
    pub error: Option<String>,
}

/// Notification payload for protocol-switch listeners.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolSwitch {
    pub from: Protocol,
    pub to: Protocol,
    pub reason: String,
}
