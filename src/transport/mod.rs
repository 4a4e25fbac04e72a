//! Transport seams between the adapters and the network.
//!
//! Adapters talk to a [`StreamConnector`] or [`SocketConnector`], never to
//! reqwest or tungstenite directly, so tests can swap in scripted
//! connections and the production dial path stays in one place.

pub mod sse;
pub mod ws;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::error::ClientError;
use crate::protocol::SseFrame;

/// A live stream of parsed SSE frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame, ClientError>> + Send>>;

/// Dials the streaming endpoint and hands back its frame stream.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<FrameStream, ClientError>;
}

/// One inbound or outbound socket payload, after transport framing.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPayload {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the connection. Code 1000 is a normal close.
    Closed { code: u16, reason: String },
}

/// A connected bidirectional socket.
pub trait SocketDuplex:
    Stream<Item = Result<SocketPayload, ClientError>>
    + Sink<SocketPayload, Error = ClientError>
    + Send
    + Unpin
{
}

impl<T> SocketDuplex for T where
    T: Stream<Item = Result<SocketPayload, ClientError>>
        + Sink<SocketPayload, Error = ClientError>
        + Send
        + Unpin
{
}

pub type SocketStream = Box<dyn SocketDuplex>;

/// Dials the socket endpoint and hands back the duplex connection.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<SocketStream, ClientError>;
}
