//! Server-sent events adapter.
//!
//! One-way transport: the server pushes frames, liveness comes from a
//! reserved heartbeat frame. Silence past the heartbeat timeout counts as a
//! dead connection and triggers the reconnect path.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::event::ConnectionState;
use crate::protocol::{HeartbeatPayload, SseFrame, HEARTBEAT_EVENT};
use crate::stats::AdapterStats;
use crate::transport::{FrameStream, StreamConnector};

use super::{AdapterSignal, ReconnectPacer, OPEN_TIMEOUT};

pub struct StreamingAdapter {
    connector: Arc<dyn StreamConnector>,
    stats: Arc<AdapterStats>,
    network: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingAdapter {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        stats: Arc<AdapterStats>,
        network: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            stats,
            network,
            task: Mutex::new(None),
        }
    }

    /// Dial the stream and, on success, hand the session to a supervisor
    /// task. A failed initial dial returns the error without retrying so the
    /// caller can fall back to the other protocol.
    pub async fn connect(
        &self,
        config: ConnectionConfig,
        signals: mpsc::UnboundedSender<AdapterSignal>,
    ) -> Result<(), ClientError> {
        self.disconnect().await;

        let url = config.stream_url();
        let frames = open_stream(&*self.connector, &url).await?;

        self.stats.mark_connected();
        info!(url, "SSE stream connected");

        let session = StreamSession {
            connector: Arc::clone(&self.connector),
            stats: Arc::clone(&self.stats),
            network: self.network.clone(),
            config,
            url,
            signals,
        };
        let handle = tokio::spawn(session.run(frames));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Abort the supervisor task. Any pending reconnect timer dies with it.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            self.stats.mark_disconnected();
            debug!("SSE supervisor stopped");
        }
    }
}

async fn open_stream(
    connector: &dyn StreamConnector,
    url: &str,
) -> Result<FrameStream, ClientError> {
    timeout(OPEN_TIMEOUT, connector.open(url))
        .await
        .map_err(|_| ClientError::ConnectionTimeout(OPEN_TIMEOUT))?
}

enum StreamEnd {
    /// The stream died; the reconnect loop takes over.
    Lost(String),
    /// Network reported offline. The session ends and the orchestrator
    /// redials when connectivity returns.
    Offline,
}

struct StreamSession {
    connector: Arc<dyn StreamConnector>,
    stats: Arc<AdapterStats>,
    network: watch::Receiver<bool>,
    config: ConnectionConfig,
    url: String,
    signals: mpsc::UnboundedSender<AdapterSignal>,
}

impl StreamSession {
    async fn run(mut self, first: FrameStream) {
        let mut current = Some(first);
        let mut pacer = ReconnectPacer::new(
            self.config.reconnect_interval_ms,
            self.config.max_reconnect_attempts,
        );

        loop {
            let frames = match current.take() {
                Some(frames) => frames,
                None => match self.reconnect(&mut pacer).await {
                    Some(frames) => frames,
                    None => return,
                },
            };
            pacer.reset();

            match self.read_until_end(frames).await {
                StreamEnd::Lost(reason) => {
                    self.stats.mark_disconnected();
                    let _ = self.signals.send(AdapterSignal::Failure {
                        reason: reason.clone(),
                    });
                    let _ = self.signals.send(AdapterSignal::State(
                        ConnectionState::Reconnecting,
                        Some(reason),
                    ));
                }
                StreamEnd::Offline => {
                    self.stats.mark_disconnected();
                    let _ = self.signals.send(AdapterSignal::State(
                        ConnectionState::Disconnected,
                        Some("network offline".to_string()),
                    ));
                    return;
                }
            }
        }
    }

    /// Drive the read loop until the stream dies or the network drops.
    async fn read_until_end(&self, mut frames: FrameStream) -> StreamEnd {
        let heartbeat_timeout = Duration::from_millis(self.config.heartbeat_timeout_ms);
        let mut deadline = Instant::now() + heartbeat_timeout;
        let mut network = self.network.clone();

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        deadline = Instant::now() + heartbeat_timeout;
                        self.handle_frame(frame);
                    }
                    Some(Err(e)) => return StreamEnd::Lost(format!("stream error: {e}")),
                    None => return StreamEnd::Lost("stream ended by server".to_string()),
                },
                _ = sleep_until(deadline) => {
                    return StreamEnd::Lost(
                        ClientError::HeartbeatTimeout(heartbeat_timeout).to_string(),
                    );
                }
                changed = network.changed() => {
                    // A dropped sender means the owning client is gone.
                    if changed.is_err() || !*network.borrow() {
                        return StreamEnd::Offline;
                    }
                }
            }
        }
    }

    /// Latency samples measure local frame processing time, one per parsed
    /// frame, not server transit.
    fn handle_frame(&self, frame: SseFrame) {
        let started = Instant::now();
        if frame.event == HEARTBEAT_EVENT {
            match serde_json::from_str::<HeartbeatPayload>(&frame.data) {
                Ok(payload) => {
                    self.stats.set_connection_id(&payload.connection_id);
                    self.stats.mark_heartbeat();
                    self.stats
                        .record_latency(started.elapsed().as_secs_f64() * 1000.0);
                }
                Err(e) => warn!(error = %e, "malformed heartbeat frame"),
            }
            return;
        }

        match frame.into_unified() {
            Ok(event) => {
                self.stats.record_received();
                self.stats
                    .record_latency(started.elapsed().as_secs_f64() * 1000.0);
                let _ = self.signals.send(AdapterSignal::Event(event));
            }
            Err(e) => {
                self.stats.record_dropped();
                warn!(error = %e, "dropping malformed event frame");
            }
        }
    }

    /// Backoff-paced redial loop. Returns None once attempts are exhausted
    /// or the network drops, after reporting the corresponding state.
    async fn reconnect(&mut self, pacer: &mut ReconnectPacer) -> Option<FrameStream> {
        loop {
            let Some(delay) = pacer.next_delay() else {
                warn!(
                    attempts = pacer.attempt(),
                    "SSE reconnect attempts exhausted"
                );
                let _ = self.signals.send(AdapterSignal::State(
                    ConnectionState::Failed,
                    Some("reconnect attempts exhausted".to_string()),
                ));
                return None;
            };
            self.stats.record_reconnect_attempt();
            debug!(attempt = pacer.attempt(), delay_ms = delay.as_millis() as u64, "SSE redial scheduled");
            tokio::time::sleep(delay).await;

            if !*self.network.borrow() {
                let _ = self.signals.send(AdapterSignal::State(
                    ConnectionState::Disconnected,
                    Some("network offline".to_string()),
                ));
                return None;
            }

            match open_stream(&*self.connector, &self.url).await {
                Ok(frames) => {
                    self.stats.mark_connected();
                    let _ = self
                        .signals
                        .send(AdapterSignal::State(ConnectionState::Connected, None));
                    info!(attempt = pacer.attempt(), "SSE stream reconnected");
                    return Some(frames);
                }
                Err(e) => {
                    warn!(attempt = pacer.attempt(), error = %e, "SSE redial failed");
                    let _ = self.signals.send(AdapterSignal::Failure {
                        reason: format!("redial failed: {e}"),
                    });
                }
            }
        }
    }
}
