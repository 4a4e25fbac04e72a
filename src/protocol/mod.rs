//! Wire-level message shapes for both transports.
//!
//! Outbound control messages are adjacently tagged (`type`/`data`) to match
//! the server's expectations; inbound messages are dispatched over a closed
//! set of type tags with an explicit catch-all so an unknown tag can never
//! bring a connection down.

pub mod compression;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::event::{EventPriority, Protocol, UnifiedEvent};

/// Reserved SSE frame name carrying `{connection_id}` as a liveness signal.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// One parsed frame of the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Frame name (the event type tag).
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Payload of the reserved heartbeat frame.
#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    pub connection_id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// JSON body of an SSE event frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SseEventPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl SseFrame {
    /// Normalize an event frame into a [`UnifiedEvent`].
    ///
    /// The frame name is authoritative for the type tag; the body's `type`
    /// field is a fallback for servers that only set it there.
    pub fn into_unified(self) -> Result<UnifiedEvent, ClientError> {
        let payload: SseEventPayload = serde_json::from_str(&self.data)
            .map_err(|e| ClientError::Protocol(format!("malformed event payload: {e}")))?;
        let event_type = if self.event.is_empty() || self.event == "message" {
            payload.event_type.unwrap_or_else(|| self.event.clone())
        } else {
            self.event
        };
        Ok(UnifiedEvent {
            id: payload.id.or(self.id),
            event_type,
            payload: payload.data,
            timestamp: parse_timestamp(payload.timestamp.as_deref()),
            protocol: Protocol::Sse,
            priority: payload.priority.and_then(|p| EventPriority::try_from(p).ok()),
        })
    }
}

/// Client-to-server control messages on the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        channels: Vec<String>,
        #[serde(default)]
        filters: serde_json::Value,
    },
    Unsubscribe {
        channels: Vec<String>,
    },
    Configure {
        config: serde_json::Value,
    },
    Publish {
        event: PublishEvent,
    },
    Ping {
        id: String,
    },
}

/// Event body of a `publish` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

impl ClientMessage {
    pub fn publish(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Publish {
            event: PublishEvent {
                event_type: event_type.into(),
                data,
            },
        }
    }

    pub fn ping(id: impl Into<String>) -> Self {
        Self::Ping { id: id.into() }
    }
}

/// Event body of an inbound `event` message.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketEventPayload {
    pub event_type: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub source: Option<String>,
}

impl SocketEventPayload {
    pub fn into_unified(self) -> UnifiedEvent {
        UnifiedEvent {
            id: self.event_id,
            event_type: self.event_type,
            payload: self.payload,
            timestamp: parse_timestamp(self.timestamp.as_deref()),
            protocol: Protocol::WebSocket,
            priority: self.priority.and_then(|p| EventPriority::try_from(p).ok()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawServerMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Server-to-client messages on the WebSocket.
#[derive(Debug)]
pub enum ServerMessage {
    ConnectionEstablished {
        connection_id: String,
    },
    Pong {
        ping_id: Option<String>,
    },
    Event(SocketEventPayload),
    Error {
        code: Option<String>,
        message: Option<String>,
    },
    SubscriptionUpdated(serde_json::Value),
    ConfigurationUpdated(serde_json::Value),
    PublishResult(serde_json::Value),
    /// Unrecognized type tag; logged and ignored by the adapter.
    Unknown {
        kind: String,
    },
}

#[derive(Debug, Deserialize)]
struct ConnectionEstablishedData {
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct PongData {
    #[serde(default)]
    ping_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ServerMessage {
    /// Parse one inbound text message.
    ///
    /// Unknown type tags succeed as [`ServerMessage::Unknown`]; only frames
    /// that are not valid JSON envelopes, or whose payload does not match
    /// the declared type, are errors.
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        let raw: RawServerMessage = serde_json::from_str(text)
            .map_err(|e| ClientError::Protocol(format!("malformed message envelope: {e}")))?;
        let parsed = match raw.kind.as_str() {
            "connection_established" => {
                let data: ConnectionEstablishedData = decode(raw.data)?;
                Self::ConnectionEstablished {
                    connection_id: data.connection_id,
                }
            }
            "pong" => {
                let data: PongData = decode(raw.data)?;
                Self::Pong {
                    ping_id: data.ping_id,
                }
            }
            "event" => Self::Event(decode(raw.data)?),
            "error" => {
                let data: ErrorData = decode(raw.data)?;
                Self::Error {
                    code: data.code,
                    message: data.message,
                }
            }
            "subscription_updated" => Self::SubscriptionUpdated(raw.data),
            "configuration_updated" => Self::ConfigurationUpdated(raw.data),
            "publish_result" => Self::PublishResult(raw.data),
            other => Self::Unknown {
                kind: other.to_string(),
            },
        };
        Ok(parsed)
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, ClientError> {
    serde_json::from_value(value)
        .map_err(|e| ClientError::Protocol(format!("malformed message payload: {e}")))
}

/// Parse a server timestamp leniently.
///
/// The server emits naive UTC ISO-8601 strings; RFC 3339 with an offset is
/// also accepted. Anything else falls back to the local receive time rather
/// than dropping the event.
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    Utc::now()
}
