//! WebSocket adapter.
//!
//! Bidirectional transport. Liveness is application-level ping/pong on top
//! of the transport's own keepalive. Outbound messages sent while the
//! session is between connections are queued and flushed in order once the
//! socket is back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::event::ConnectionState;
use crate::protocol::compression::{decode_binary, compress, COMPRESSION_THRESHOLD};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::stats::AdapterStats;
use crate::transport::{SocketConnector, SocketPayload, SocketStream};

use super::{AdapterSignal, ReconnectPacer, OPEN_TIMEOUT, PING_TIMEOUT};

/// Resolves once the message has been written to the wire.
#[derive(Debug)]
pub struct SendReceipt(oneshot::Receiver<Result<(), ClientError>>);

impl SendReceipt {
    pub async fn delivered(self) -> Result<(), ClientError> {
        self.0.await.unwrap_or_else(|_| {
            Err(ClientError::Send(
                "connection closed before delivery".to_string(),
            ))
        })
    }
}

enum SocketCommand {
    Send {
        message: ClientMessage,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Ping {
        done: oneshot::Sender<Result<Duration, ClientError>>,
    },
}

pub struct SocketAdapter {
    connector: Arc<dyn SocketConnector>,
    stats: Arc<AdapterStats>,
    network: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    commands: Mutex<Option<mpsc::UnboundedSender<SocketCommand>>>,
}

impl SocketAdapter {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        stats: Arc<AdapterStats>,
        network: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            stats,
            network,
            task: Mutex::new(None),
            commands: Mutex::new(None),
        }
    }

    pub async fn connect(
        &self,
        config: ConnectionConfig,
        signals: mpsc::UnboundedSender<AdapterSignal>,
    ) -> Result<(), ClientError> {
        self.disconnect().await;

        let url = config.socket_url();
        let socket = open_socket(&*self.connector, &url).await?;

        self.stats.mark_connected();
        info!(url, "WebSocket connected");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.commands.lock().await = Some(command_tx);

        let session = SocketSession {
            connector: Arc::clone(&self.connector),
            stats: Arc::clone(&self.stats),
            network: self.network.clone(),
            config,
            url,
            signals,
            commands: command_rx,
            queue: VecDeque::new(),
            pending_pings: HashMap::new(),
        };
        let handle = tokio::spawn(session.run(socket));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.commands.lock().await.take();
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            self.stats.mark_disconnected();
            debug!("WebSocket supervisor stopped");
        }
    }

    /// Hand a message to the session. Queued transparently while the
    /// session is reconnecting; fails only when there is no session at all.
    pub async fn send(&self, message: ClientMessage) -> Result<SendReceipt, ClientError> {
        let commands = self.commands.lock().await;
        let sender = commands.as_ref().ok_or(ClientError::NotConnected)?;
        let (done, receipt) = oneshot::channel();
        sender
            .send(SocketCommand::Send { message, done })
            .map_err(|_| ClientError::NotConnected)?;
        Ok(SendReceipt(receipt))
    }

    /// Round-trip an application ping and return its latency.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let receipt = {
            let commands = self.commands.lock().await;
            let sender = commands.as_ref().ok_or(ClientError::NotConnected)?;
            let (done, receipt) = oneshot::channel();
            sender
                .send(SocketCommand::Ping { done })
                .map_err(|_| ClientError::NotConnected)?;
            receipt
        };
        match timeout(PING_TIMEOUT, receipt).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::PingTimeout(PING_TIMEOUT)),
        }
    }
}

async fn open_socket(
    connector: &dyn SocketConnector,
    url: &str,
) -> Result<SocketStream, ClientError> {
    timeout(OPEN_TIMEOUT, connector.open(url))
        .await
        .map_err(|_| ClientError::ConnectionTimeout(OPEN_TIMEOUT))?
}

struct PendingSend {
    message: ClientMessage,
    done: oneshot::Sender<Result<(), ClientError>>,
}

struct PendingPing {
    sent: Instant,
    caller: Option<oneshot::Sender<Result<Duration, ClientError>>>,
}

enum SessionEnd {
    /// Server closed with code 1000. No reconnect.
    NormalClose,
    /// Connection lost; the reconnect loop takes over.
    Failure(String),
    /// Network reported offline. The session ends and the orchestrator
    /// redials when connectivity returns.
    Offline,
    /// The adapter dropped its command sender.
    Detached,
}

enum Flow {
    Continue,
    End(SessionEnd),
}

enum Action {
    Inbound(Option<Result<SocketPayload, ClientError>>),
    Command(Option<SocketCommand>),
    Keepalive,
    PongTimeout,
    NetworkChanged { sender_gone: bool },
}

struct SocketSession {
    connector: Arc<dyn SocketConnector>,
    stats: Arc<AdapterStats>,
    network: watch::Receiver<bool>,
    config: ConnectionConfig,
    url: String,
    signals: mpsc::UnboundedSender<AdapterSignal>,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    queue: VecDeque<PendingSend>,
    pending_pings: HashMap<String, PendingPing>,
}

impl SocketSession {
    async fn run(mut self, first: SocketStream) {
        let mut current = Some(first);
        let mut pacer = ReconnectPacer::new(
            self.config.reconnect_interval_ms,
            self.config.max_reconnect_attempts,
        );

        loop {
            let socket = match current.take() {
                Some(socket) => socket,
                None => match self.reconnect(&mut pacer).await {
                    Some(socket) => socket,
                    None => {
                        self.fail_pending("connection failed");
                        return;
                    }
                },
            };
            pacer.reset();

            match self.drive(socket).await {
                SessionEnd::NormalClose => {
                    info!("server closed the socket normally");
                    self.stats.mark_disconnected();
                    let _ = self
                        .signals
                        .send(AdapterSignal::State(ConnectionState::Disconnected, None));
                    self.fail_pending("connection closed");
                    return;
                }
                SessionEnd::Failure(reason) => {
                    self.stats.mark_disconnected();
                    let _ = self.signals.send(AdapterSignal::Failure {
                        reason: reason.clone(),
                    });
                    let _ = self.signals.send(AdapterSignal::State(
                        ConnectionState::Reconnecting,
                        Some(reason),
                    ));
                }
                SessionEnd::Offline => {
                    self.stats.mark_disconnected();
                    let _ = self.signals.send(AdapterSignal::State(
                        ConnectionState::Disconnected,
                        Some("network offline".to_string()),
                    ));
                    self.fail_pending("network offline");
                    return;
                }
                SessionEnd::Detached => return,
            }
        }
    }

    /// One connected socket's lifetime: subscribe, flush the queue, then
    /// multiplex inbound frames, outbound commands, and keepalive pings.
    async fn drive(&mut self, socket: SocketStream) -> SessionEnd {
        let (mut sink, mut source) = socket.split();
        self.pending_pings.clear();

        let subscribe = ClientMessage::Subscribe {
            channels: self.config.channels.clone(),
            filters: serde_json::json!({
                "event_types": self.config.event_types,
                "agent_ids": self.config.agent_ids,
                "min_priority": self.config.min_priority,
            }),
        };
        if let Err(e) = self.write(&mut sink, &subscribe).await {
            return SessionEnd::Failure(format!("subscribe failed: {e}"));
        }

        while let Some(pending) = self.queue.pop_front() {
            match self.write(&mut sink, &pending.message).await {
                Ok(()) => {
                    let _ = pending.done.send(Ok(()));
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.queue.push_front(pending);
                    return SessionEnd::Failure(reason);
                }
            }
        }

        let ping_period = Duration::from_millis(self.config.ping_interval_ms);
        let mut keepalive = interval_at(Instant::now() + ping_period, ping_period);
        let mut network = self.network.clone();

        loop {
            let pong_deadline = self
                .pending_pings
                .values()
                .map(|p| p.sent + PING_TIMEOUT)
                .min();

            let action = tokio::select! {
                payload = source.next() => Action::Inbound(payload),
                command = self.commands.recv() => Action::Command(command),
                _ = keepalive.tick() => Action::Keepalive,
                _ = async {
                    match pong_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => Action::PongTimeout,
                changed = network.changed() => Action::NetworkChanged {
                    sender_gone: changed.is_err(),
                },
            };

            match action {
                Action::Inbound(payload) => {
                    let flow = match payload {
                        Some(Ok(payload)) => self.handle_payload(payload).await,
                        Some(Err(e)) => Flow::End(SessionEnd::Failure(e.to_string())),
                        None => Flow::End(SessionEnd::Failure(
                            "socket closed without close frame".to_string(),
                        )),
                    };
                    if let Flow::End(end) = flow {
                        return end;
                    }
                }
                Action::Command(Some(SocketCommand::Send { message, done })) => {
                    match self.write(&mut sink, &message).await {
                        Ok(()) => {
                            let _ = done.send(Ok(()));
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            self.queue.push_front(PendingSend { message, done });
                            return SessionEnd::Failure(reason);
                        }
                    }
                }
                Action::Command(Some(SocketCommand::Ping { done })) => {
                    if let Err(e) = self.send_ping(&mut sink, Some(done)).await {
                        return SessionEnd::Failure(format!("ping failed: {e}"));
                    }
                }
                Action::Command(None) => return SessionEnd::Detached,
                Action::Keepalive => {
                    if let Err(e) = self.send_ping(&mut sink, None).await {
                        return SessionEnd::Failure(format!("keepalive failed: {e}"));
                    }
                }
                Action::PongTimeout => {
                    return SessionEnd::Failure(format!(
                        "no pong within {}ms",
                        PING_TIMEOUT.as_millis()
                    ));
                }
                Action::NetworkChanged { sender_gone } => {
                    // A dropped sender means the owning client is gone.
                    if sender_gone || !*network.borrow() {
                        return SessionEnd::Offline;
                    }
                }
            }
        }
    }

    async fn handle_payload(&mut self, payload: SocketPayload) -> Flow {
        let text = match payload {
            SocketPayload::Text(text) => text,
            SocketPayload::Binary(bytes) => match decode_binary(&bytes) {
                Ok(text) => text,
                Err(e) => {
                    self.stats.record_dropped();
                    warn!(error = %e, "dropping undecodable binary frame");
                    return Flow::Continue;
                }
            },
            SocketPayload::Closed { code, reason } => {
                return if code == 1000 {
                    Flow::End(SessionEnd::NormalClose)
                } else {
                    Flow::End(SessionEnd::Failure(format!(
                        "socket closed ({code}): {reason}"
                    )))
                };
            }
        };

        let message = match ServerMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                self.stats.record_dropped();
                warn!(error = %e, "dropping malformed message");
                return Flow::Continue;
            }
        };

        match message {
            ServerMessage::ConnectionEstablished { connection_id } => {
                debug!(connection_id, "session established");
                self.stats.set_connection_id(&connection_id);
                self.stats.mark_heartbeat();
            }
            ServerMessage::Pong { ping_id } => {
                self.stats.mark_heartbeat();
                self.resolve_pong(ping_id);
            }
            ServerMessage::Event(payload) => {
                self.stats.record_received();
                let _ = self
                    .signals
                    .send(AdapterSignal::Event(payload.into_unified()));
            }
            ServerMessage::Error { code, message } => {
                warn!(?code, ?message, "server reported an error");
            }
            ServerMessage::SubscriptionUpdated(data) => {
                debug!(%data, "subscription updated");
            }
            ServerMessage::ConfigurationUpdated(data) => {
                debug!(%data, "configuration updated");
            }
            ServerMessage::PublishResult(data) => {
                debug!(%data, "publish acknowledged");
            }
            ServerMessage::Unknown { kind } => {
                debug!(kind, "ignoring unknown message type");
            }
        }
        Flow::Continue
    }

    fn resolve_pong(&mut self, ping_id: Option<String>) {
        let Some(id) = ping_id else {
            // Pong without an id still proves the link is alive.
            self.pending_pings.clear();
            return;
        };
        if let Some(pending) = self.pending_pings.remove(&id) {
            let latency = pending.sent.elapsed();
            self.stats.record_latency(latency.as_secs_f64() * 1000.0);
            if let Some(caller) = pending.caller {
                let _ = caller.send(Ok(latency));
            }
        }
    }

    async fn send_ping<S>(
        &mut self,
        sink: &mut S,
        caller: Option<oneshot::Sender<Result<Duration, ClientError>>>,
    ) -> Result<(), ClientError>
    where
        S: futures::Sink<SocketPayload, Error = ClientError> + Unpin,
    {
        let id = Uuid::new_v4().to_string();
        let message = ClientMessage::ping(id.clone());
        self.write(sink, &message).await?;
        self.pending_pings.insert(
            id,
            PendingPing {
                sent: Instant::now(),
                caller,
            },
        );
        Ok(())
    }

    async fn write<S>(&self, sink: &mut S, message: &ClientMessage) -> Result<(), ClientError>
    where
        S: futures::Sink<SocketPayload, Error = ClientError> + Unpin,
    {
        let serialized = serde_json::to_string(message)
            .map_err(|e| ClientError::Send(format!("serialization failed: {e}")))?;
        let payload = if self.config.compression && serialized.len() > COMPRESSION_THRESHOLD {
            SocketPayload::Binary(compress(serialized.as_bytes())?)
        } else {
            SocketPayload::Text(serialized)
        };
        sink.send(payload).await?;
        self.stats.record_sent();
        Ok(())
    }

    async fn reconnect(&mut self, pacer: &mut ReconnectPacer) -> Option<SocketStream> {
        loop {
            let Some(delay) = pacer.next_delay() else {
                warn!(
                    attempts = pacer.attempt(),
                    "WebSocket reconnect attempts exhausted"
                );
                let _ = self.signals.send(AdapterSignal::State(
                    ConnectionState::Failed,
                    Some("reconnect attempts exhausted".to_string()),
                ));
                return None;
            };
            self.stats.record_reconnect_attempt();
            debug!(attempt = pacer.attempt(), delay_ms = delay.as_millis() as u64, "WebSocket redial scheduled");

            // Keep accepting commands during the wait so sends queue up
            // instead of failing.
            let deadline = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    command = self.commands.recv() => match command {
                        Some(SocketCommand::Send { message, done }) => {
                            self.queue.push_back(PendingSend { message, done });
                        }
                        Some(SocketCommand::Ping { done }) => {
                            let _ = done.send(Err(ClientError::NotConnected));
                        }
                        None => return None,
                    }
                }
            }

            if !*self.network.borrow() {
                let _ = self.signals.send(AdapterSignal::State(
                    ConnectionState::Disconnected,
                    Some("network offline".to_string()),
                ));
                return None;
            }

            match open_socket(&*self.connector, &self.url).await {
                Ok(socket) => {
                    self.stats.mark_connected();
                    let _ = self
                        .signals
                        .send(AdapterSignal::State(ConnectionState::Connected, None));
                    info!(attempt = pacer.attempt(), "WebSocket reconnected");
                    return Some(socket);
                }
                Err(e) => {
                    warn!(attempt = pacer.attempt(), error = %e, "WebSocket redial failed");
                    let _ = self.signals.send(AdapterSignal::Failure {
                        reason: format!("redial failed: {e}"),
                    });
                }
            }
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for pending in self.queue.drain(..) {
            let _ = pending.done.send(Err(ClientError::Send(reason.to_string())));
        }
        for (_, pending) in self.pending_pings.drain() {
            if let Some(caller) = pending.caller {
                let _ = caller.send(Err(ClientError::NotConnected));
            }
        }
    }
}
