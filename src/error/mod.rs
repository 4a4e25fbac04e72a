use std::time::Duration;

use thiserror::Error;

use crate::event::Protocol;

/// Errors surfaced by the communication layer.
///
/// Routine transport flakiness is retried internally with backoff and never
/// reaches application code; these variants cover configuration problems,
/// invalid operations, and retry-cap exhaustion.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Heartbeat lost: no liveness frame within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Ping timed out after {0:?}")]
    PingTimeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Operation not supported on the {0} protocol")]
    Unsupported(Protocol),

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, ClientError>;
