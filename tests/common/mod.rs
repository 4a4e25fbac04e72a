//! Scripted transports driving the client without a network.

// Shared by several test binaries; not every helper is used by each one.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Sink, Stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use pulselink::error::ClientError;
use pulselink::protocol::SseFrame;
use pulselink::transport::{
    FrameStream, SocketConnector, SocketPayload, SocketStream, StreamConnector,
};
use pulselink::ConnectionConfig;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Defaults tuned so background timers that a test is not exercising stay
/// out of the way under a paused clock.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        ping_interval_ms: 3_600_000,
        health_check_interval_ms: 3_600_000,
        ..ConnectionConfig::default()
    }
}

pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..3000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

enum StreamPlan {
    Refuse,
    Accept(mpsc::UnboundedReceiver<Result<SseFrame, ClientError>>),
}

/// Stream connector answering dials from a pre-scripted queue. An empty
/// queue refuses the dial.
pub struct ScriptedStreams {
    plans: Mutex<VecDeque<StreamPlan>>,
    dials: AtomicUsize,
}

impl ScriptedStreams {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(VecDeque::new()),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn refuse_next(&self) {
        self.plans.lock().unwrap().push_back(StreamPlan::Refuse);
    }

    /// Script an accepted dial; the returned sender feeds it frames.
    pub fn accept_next(&self) -> mpsc::UnboundedSender<Result<SseFrame, ClientError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.plans.lock().unwrap().push_back(StreamPlan::Accept(rx));
        tx
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnector for ScriptedStreams {
    async fn open(&self, _url: &str) -> Result<FrameStream, ClientError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        match self.plans.lock().unwrap().pop_front() {
            Some(StreamPlan::Accept(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            Some(StreamPlan::Refuse) | None => {
                Err(ClientError::Connection("connection refused".to_string()))
            }
        }
    }
}

/// Test-side handle to one accepted socket dial.
pub struct SocketPeer {
    pub to_client: mpsc::UnboundedSender<Result<SocketPayload, ClientError>>,
    pub from_client: mpsc::UnboundedReceiver<SocketPayload>,
}

impl SocketPeer {
    pub fn send_json(&self, value: serde_json::Value) {
        self.to_client
            .send(Ok(SocketPayload::Text(value.to_string())))
            .expect("client side gone");
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.to_client
            .send(Ok(SocketPayload::Closed {
                code,
                reason: reason.to_string(),
            }))
            .expect("client side gone");
    }

    pub async fn next_json(&mut self) -> serde_json::Value {
        match self.from_client.recv().await.expect("socket closed") {
            SocketPayload::Text(text) => serde_json::from_str(&text).expect("invalid json"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    pub async fn expect_subscribe(&mut self) -> serde_json::Value {
        let message = self.next_json().await;
        assert_eq!(message["type"], "subscribe");
        message
    }
}

enum SocketPlan {
    Refuse,
    Accept(MockDuplex),
}

/// Socket connector answering dials from a pre-scripted queue.
pub struct ScriptedSockets {
    plans: Mutex<VecDeque<SocketPlan>>,
    dials: AtomicUsize,
}

impl ScriptedSockets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(VecDeque::new()),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn refuse_next(&self) {
        self.plans.lock().unwrap().push_back(SocketPlan::Refuse);
    }

    pub fn accept_next(&self) -> SocketPeer {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.plans
            .lock()
            .unwrap()
            .push_back(SocketPlan::Accept(MockDuplex {
                inbound: in_rx,
                outbound: out_tx,
            }));
        SocketPeer {
            to_client: in_tx,
            from_client: out_rx,
        }
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketConnector for ScriptedSockets {
    async fn open(&self, _url: &str) -> Result<SocketStream, ClientError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        match self.plans.lock().unwrap().pop_front() {
            Some(SocketPlan::Accept(duplex)) => Ok(Box::new(duplex)),
            Some(SocketPlan::Refuse) | None => {
                Err(ClientError::Connection("connection refused".to_string()))
            }
        }
    }
}

/// In-memory duplex bridged over two channels.
pub struct MockDuplex {
    inbound: mpsc::UnboundedReceiver<Result<SocketPayload, ClientError>>,
    outbound: mpsc::UnboundedSender<SocketPayload>,
}

impl Stream for MockDuplex {
    type Item = Result<SocketPayload, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

impl Sink<SocketPayload> for MockDuplex {
    type Error = ClientError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: SocketPayload) -> Result<(), Self::Error> {
        self.outbound
            .send(item)
            .map_err(|_| ClientError::Send("peer hung up".to_string()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

pub fn heartbeat_frame(connection_id: &str) -> SseFrame {
    SseFrame {
        event: "heartbeat".to_string(),
        data: serde_json::json!({ "connection_id": connection_id }).to_string(),
        id: None,
    }
}

pub fn event_frame(event_type: &str, payload: serde_json::Value) -> SseFrame {
    SseFrame {
        event: event_type.to_string(),
        data: serde_json::json!({
            "id": "evt-1",
            "type": event_type,
            "timestamp": "2026-02-03T10:00:00.000000",
            "data": payload,
            "priority": 2,
        })
        .to_string(),
        id: None,
    }
}
