//! Production SSE transport over reqwest.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use tracing::debug;

use crate::error::ClientError;
use crate::protocol::SseFrame;

use super::{FrameStream, StreamConnector};

pub struct HttpStreamConnector {
    client: reqwest::Client,
}

impl HttpStreamConnector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpStreamConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamConnector for HttpStreamConnector {
    async fn open(&self, url: &str) -> Result<FrameStream, ClientError> {
        debug!(url, "opening SSE stream");
        let response = self
            .client
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::Connection(format!("SSE request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Connection(format!(
                "SSE endpoint returned {status}"
            )));
        }

        let frames = response.bytes_stream().eventsource().map(|item| {
            item.map(|event| SseFrame {
                event: event.event,
                data: event.data,
                id: if event.id.is_empty() {
                    None
                } else {
                    Some(event.id)
                },
            })
            .map_err(|e| ClientError::Connection(format!("SSE stream error: {e}")))
        });

        Ok(Box::pin(frames))
    }
}
