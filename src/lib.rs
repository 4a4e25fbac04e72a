// Foundation layer (shared components)
pub mod backoff;
pub mod config;
pub mod error;
pub mod event;
pub mod stats;

// Wire layer
pub mod protocol;
pub mod transport;

// Session layer
pub mod adapter;
pub mod listener;

// Application layer
pub mod client;
pub mod registry;

pub use client::{ClientStats, RealtimeClient};
pub use config::{ConfigUpdate, ConnectionConfig};
pub use error::{ClientError, Result};
pub use event::{
    ConnectionState, EventPriority, Protocol, ProtocolSwitch, StateChange, UnifiedEvent,
};
pub use listener::ListenerId;
pub use registry::ClientRegistry;
pub use stats::{ConnectionStats, HealthReport};
