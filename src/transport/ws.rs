//! Production WebSocket transport over tokio-tungstenite.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Sink, Stream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::ClientError;

use super::{SocketConnector, SocketPayload, SocketStream};

pub struct WsSocketConnector;

impl WsSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WsSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SocketConnector for WsSocketConnector {
    async fn open(&self, url: &str) -> Result<SocketStream, ClientError> {
        debug!(url, "opening WebSocket");
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| ClientError::Connection(format!("WebSocket handshake failed: {e}")))?;
        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsDuplex { inner: stream }))
    }
}

/// Adapts the tungstenite message stream to [`SocketPayload`] frames.
///
/// Transport-level ping/pong is handled by tungstenite itself and never
/// surfaced; application-level ping/pong travels as text messages.
struct WsDuplex {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Stream for WsDuplex {
    type Item = Result<SocketPayload, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let message = match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => message,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(ClientError::Connection(format!(
                        "WebSocket read failed: {e}"
                    )))))
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            let payload = match message {
                Message::Text(text) => SocketPayload::Text(text.to_string()),
                Message::Binary(bytes) => SocketPayload::Binary(bytes.to_vec()),
                Message::Close(frame) => match frame {
                    Some(frame) => SocketPayload::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.to_string(),
                    },
                    None => SocketPayload::Closed {
                        code: 1005,
                        reason: String::new(),
                    },
                },
                // Keepalive frames answered by the library; nothing to surface.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Poll::Ready(Some(Ok(payload)));
        }
    }
}

impl Sink<SocketPayload> for WsDuplex {
    type Error = ClientError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(send_err)
    }

    fn start_send(mut self: Pin<&mut Self>, item: SocketPayload) -> Result<(), Self::Error> {
        let message = match item {
            SocketPayload::Text(text) => Message::Text(text.into()),
            SocketPayload::Binary(bytes) => Message::Binary(bytes.into()),
            SocketPayload::Closed { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        };
        Pin::new(&mut self.inner)
            .start_send(message)
            .map_err(send_err)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(send_err)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(send_err)
    }
}

fn send_err(e: tokio_tungstenite::tungstenite::Error) -> ClientError {
    ClientError::Send(format!("WebSocket write failed: {e}"))
}
