//! Connection configuration.
//!
//! Created once at startup (defaults, file, or `PULSELINK_*` environment
//! variables) and mutable afterwards only through [`ConfigUpdate`], which the
//! client applies with a full reconnect when a connection is live.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ClientError;
use crate::event::Protocol;

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Base endpoint, e.g. `http://localhost:8000`. The WebSocket URL is
    /// derived from it by scheme rewrite (`http` -> `ws`, `https` -> `wss`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Channels to subscribe to on connect.
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    /// Optional event-type filter; empty means all types.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Optional agent-id filter; empty means all agents.
    #[serde(default)]
    pub agent_ids: Vec<String>,
    /// Minimum event priority (1=low .. 4=critical).
    #[serde(default = "default_min_priority")]
    pub min_priority: u8,
    /// Ask the server to gzip large payloads, and gzip large outbound ones.
    #[serde(default)]
    pub compression: bool,
    /// Number of buffered events the server replays on connect.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
    /// Base reconnect delay in milliseconds (doubles per attempt).
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// SSE liveness: missing heartbeat frames past this is a connection error.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// WebSocket liveness: automatic ping cadence.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Failures within the trailing 60s at or above this count mark the
    /// connection unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// Delay before an automatic switch to the alternate protocol.
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,
    #[serde(default = "default_preferred_protocol")]
    pub preferred_protocol: Protocol,
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,
}

fn default_endpoint() -> String {
    "http://localhost:8000".to_string()
}

fn default_stream_path() -> String {
    "/api/stream".to_string()
}

fn default_socket_path() -> String {
    "/api/ws".to_string()
}

fn default_channels() -> Vec<String> {
    vec![
        "agents".to_string(),
        "tasks".to_string(),
        "metrics".to_string(),
    ]
}

fn default_min_priority() -> u8 {
    1
}

fn default_buffer_size() -> u32 {
    50
}

fn default_reconnect_interval_ms() -> u64 {
    3000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> usize {
    5
}

fn default_fallback_delay_ms() -> u64 {
    5000
}

fn default_preferred_protocol() -> Protocol {
    Protocol::Sse
}

fn default_fallback_enabled() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            stream_path: default_stream_path(),
            socket_path: default_socket_path(),
            channels: default_channels(),
            event_types: Vec::new(),
            agent_ids: Vec::new(),
            min_priority: default_min_priority(),
            compression: false,
            buffer_size: default_buffer_size(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            failure_threshold: default_failure_threshold(),
            fallback_delay_ms: default_fallback_delay_ms(),
            preferred_protocol: default_preferred_protocol(),
            fallback_enabled: default_fallback_enabled(),
        }
    }
}

impl ConnectionConfig {
    /// Load configuration from an optional `pulselink` config file and
    /// `PULSELINK_*` environment variables (list values comma-separated).
    pub fn from_env() -> Result<Self, ClientError> {
        let _ = dotenvy::dotenv();

        let settings = Config::builder()
            .add_source(File::with_name("pulselink").required(false))
            .add_source(
                Environment::with_prefix("PULSELINK")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Query string shared by both endpoints; the filters are identical.
    pub fn query_string(&self) -> String {
        let mut params = vec![
            format!("channels={}", self.channels.join(",")),
            format!("min_priority={}", self.min_priority),
            format!("compression={}", self.compression),
            format!("buffer_size={}", self.buffer_size),
        ];
        if !self.event_types.is_empty() {
            params.insert(1, format!("event_types={}", self.event_types.join(",")));
        }
        if !self.agent_ids.is_empty() {
            let pos = if self.event_types.is_empty() { 1 } else { 2 };
            params.insert(pos, format!("agent_ids={}", self.agent_ids.join(",")));
        }
        params.join("&")
    }

    /// Full URL for the streaming (SSE) endpoint.
    pub fn stream_url(&self) -> String {
        format!(
            "{}{}?{}",
            self.endpoint.trim_end_matches('/'),
            self.stream_path,
            self.query_string()
        )
    }

    /// Full URL for the WebSocket endpoint, scheme rewritten.
    pub fn socket_url(&self) -> String {
        let base = self.endpoint.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{}{}?{}", base, self.socket_path, self.query_string())
    }
}

/// Partial configuration update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub endpoint: Option<String>,
    pub channels: Option<Vec<String>>,
    pub event_types: Option<Vec<String>>,
    pub agent_ids: Option<Vec<String>>,
    pub min_priority: Option<u8>,
    pub compression: Option<bool>,
    pub buffer_size: Option<u32>,
    pub reconnect_interval_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub failure_threshold: Option<usize>,
    pub fallback_delay_ms: Option<u64>,
    pub preferred_protocol: Option<Protocol>,
    pub fallback_enabled: Option<bool>,
}

impl ConfigUpdate {
    /// Merge this update into an existing configuration.
    pub fn apply(&self, config: &mut ConnectionConfig) {
        if let Some(v) = &self.endpoint {
            config.endpoint = v.clone();
        }
        if let Some(v) = &self.channels {
            config.channels = v.clone();
        }
        if let Some(v) = &self.event_types {
            config.event_types = v.clone();
        }
        if let Some(v) = &self.agent_ids {
            config.agent_ids = v.clone();
        }
        if let Some(v) = self.min_priority {
            config.min_priority = v;
        }
        if let Some(v) = self.compression {
            config.compression = v;
        }
        if let Some(v) = self.buffer_size {
            config.buffer_size = v;
        }
        if let Some(v) = self.reconnect_interval_ms {
            config.reconnect_interval_ms = v;
        }
        if let Some(v) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout_ms = v;
        }
        if let Some(v) = self.ping_interval_ms {
            config.ping_interval_ms = v;
        }
        if let Some(v) = self.health_check_interval_ms {
            config.health_check_interval_ms = v;
        }
        if let Some(v) = self.failure_threshold {
            config.failure_threshold = v;
        }
        if let Some(v) = self.fallback_delay_ms {
            config.fallback_delay_ms = v;
        }
        if let Some(v) = self.preferred_protocol {
            config.preferred_protocol = v;
        }
        if let Some(v) = self.fallback_enabled {
            config.fallback_enabled = v;
        }
    }
}
