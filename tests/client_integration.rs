//! End-to-end client behavior against scripted transports.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_test::assert_ok;

use common::{
    event_frame, heartbeat_frame, init_tracing, test_config, wait_until, ScriptedSockets,
    ScriptedStreams,
};
use pulselink::error::ClientError;
use pulselink::transport::{SocketConnector, StreamConnector};
use pulselink::{
    ConfigUpdate, ConnectionConfig, ConnectionState, Protocol, ProtocolSwitch, RealtimeClient,
    StateChange,
};

fn build(
    config: ConnectionConfig,
    streams: &Arc<ScriptedStreams>,
    sockets: &Arc<ScriptedSockets>,
) -> RealtimeClient {
    RealtimeClient::with_connectors(
        config,
        Arc::clone(streams) as Arc<dyn StreamConnector>,
        Arc::clone(sockets) as Arc<dyn SocketConnector>,
    )
}

async fn record_switches(client: &RealtimeClient) -> Arc<Mutex<Vec<ProtocolSwitch>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .on_protocol_switch(move |switch| {
            sink.lock().unwrap().push(switch.clone());
            Ok(())
        })
        .await;
    seen
}

async fn record_states(client: &RealtimeClient) -> Arc<Mutex<Vec<StateChange>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .on_state_change(move |change| {
            sink.lock().unwrap().push(change.clone());
            Ok(())
        })
        .await;
    seen
}

#[tokio::test(start_paused = true)]
async fn test_connects_on_preferred_protocol() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let _frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);
    let switches = record_switches(&client).await;

    assert!(client.connect().await);
    assert_eq!(client.state().await, ConnectionState::Connected);
    assert_eq!(client.active_protocol().await, Some(Protocol::Sse));
    assert_eq!(streams.dials(), 1);
    assert_eq!(sockets.dials(), 0);
    assert!(switches.lock().unwrap().is_empty());

    // Connecting again with a live session is a no-op.
    assert!(client.connect().await);
    assert_eq!(streams.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_websocket_when_stream_refused() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let mut peer = sockets.accept_next();
    let client = build(test_config(), &streams, &sockets);
    let switches = record_switches(&client).await;

    assert!(client.connect().await);
    assert_eq!(client.active_protocol().await, Some(Protocol::WebSocket));
    assert_eq!(streams.dials(), 1);
    assert_eq!(sockets.dials(), 1);

    let recorded = switches.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].from, Protocol::Sse);
    assert_eq!(recorded[0].to, Protocol::WebSocket);
    assert_eq!(client.stats().await.protocol_switches, 1);

    let subscribe = peer.expect_subscribe().await;
    assert_eq!(subscribe["data"]["channels"][0], "agents");
}

#[tokio::test(start_paused = true)]
async fn test_connect_fails_when_both_protocols_refuse() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let client = build(test_config(), &streams, &sockets);

    assert!(!client.connect().await);
    assert_eq!(client.state().await, ConnectionState::Failed);
    assert_eq!(client.active_protocol().await, None);

    let err = client.send_message("x", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_disabled_stays_on_preferred() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let mut config = test_config();
    config.fallback_enabled = false;
    let client = build(config, &streams, &sockets);
    let switches = record_switches(&client).await;

    assert!(!client.connect().await);
    assert_eq!(client.state().await, ConnectionState::Failed);
    assert_eq!(sockets.dials(), 0);
    assert!(switches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stream_events_reach_listeners() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .add_event_listener(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        })
        .await;

    assert!(client.connect().await);
    frames.send(Ok(heartbeat_frame("conn-42"))).unwrap();
    frames
        .send(Ok(event_frame("task_update", json!({"task_id": 9}))))
        .unwrap();

    wait_until(|| async { !seen.lock().unwrap().is_empty() }).await;
    let events = seen.lock().unwrap().clone();
    assert_eq!(events[0].event_type, "task_update");
    assert_eq!(events[0].protocol, Protocol::Sse);
    assert_eq!(events[0].payload["task_id"], 9);
    assert_eq!(events[0].id.as_deref(), Some("evt-1"));

    let stats = client.stats().await;
    assert_eq!(stats.sse.events_received, 1);
    assert_eq!(stats.sse.connection_id.as_deref(), Some("conn-42"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_is_dropped_not_fatal() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .add_event_listener(move |event| {
            sink.lock().unwrap().push(event.event_type.clone());
            Ok(())
        })
        .await;

    assert!(client.connect().await);
    frames
        .send(Ok(pulselink::protocol::SseFrame {
            event: "task_update".to_string(),
            data: "{{not json".to_string(),
            id: None,
        }))
        .unwrap();
    frames
        .send(Ok(event_frame("task_update", json!({"ok": true}))))
        .unwrap();

    wait_until(|| async { !seen.lock().unwrap().is_empty() }).await;
    assert_eq!(client.state().await, ConnectionState::Connected);
    let stats = client.stats().await;
    assert_eq!(stats.sse.events_dropped, 1);
    assert_eq!(stats.sse.events_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_listener_error_does_not_stop_delivery() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    client
        .add_event_listener(|_| Err(anyhow::anyhow!("listener bug")))
        .await;
    let seen = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&seen);
    client
        .add_event_listener(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        })
        .await;

    assert!(client.connect().await);
    frames
        .send(Ok(event_frame("agent_status", json!({"agent": "a1"}))))
        .unwrap();

    wait_until(|| async { *seen.lock().unwrap() == 1 }).await;
    // The failing listener counts as one dropped delivery.
    let stats = client.stats().await;
    assert_eq!(stats.sse.events_dropped, 1);
    assert_eq!(stats.sse.events_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_silence_triggers_reconnect() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let first = streams.accept_next();
    let _second = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);
    let states = record_states(&client).await;

    assert!(client.connect().await);
    first.send(Ok(heartbeat_frame("conn-1"))).unwrap();

    // Heartbeat timeout (60s) plus one backoff delay.
    tokio::time::sleep(std::time::Duration::from_secs(66)).await;

    wait_until(|| async { client.state().await == ConnectionState::Connected }).await;
    assert!(states
        .lock()
        .unwrap()
        .iter()
        .any(|change| change.state == ConnectionState::Reconnecting));
    assert_eq!(streams.dials(), 2);
    let stats = client.stats().await;
    assert_eq!(stats.sse.reconnect_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_publish_over_websocket_with_receipt() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let mut peer = sockets.accept_next();
    let mut config = test_config();
    config.preferred_protocol = Protocol::WebSocket;
    let client = build(config, &streams, &sockets);

    assert!(client.connect().await);
    peer.expect_subscribe().await;

    let receipt = client
        .send_message("chat", json!({"body": "hello"}))
        .await
        .unwrap();
    let message = peer.next_json().await;
    assert_eq!(message["type"], "publish");
    assert_eq!(message["data"]["event"]["type"], "chat");
    assert_eq!(message["data"]["event"]["data"]["body"], "hello");
    assert_ok!(receipt.delivered().await);

    let stats = client.stats().await;
    assert_eq!(stats.websocket.events_sent, 2); // subscribe + publish
}

#[tokio::test(start_paused = true)]
async fn test_publish_rejected_on_stream_protocol() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let _frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    assert!(client.connect().await);
    let err = client.send_message("x", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::Unsupported(Protocol::Sse)));
}

#[tokio::test(start_paused = true)]
async fn test_queued_sends_flush_in_order_after_reconnect() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let mut first = sockets.accept_next();
    let mut config = test_config();
    config.preferred_protocol = Protocol::WebSocket;
    let client = build(config, &streams, &sockets);
    let states = record_states(&client).await;

    assert!(client.connect().await);
    first.expect_subscribe().await;

    let mut second = sockets.accept_next();
    first.close(1006, "going away");
    wait_until(|| async {
        states
            .lock()
            .unwrap()
            .iter()
            .any(|change| change.state == ConnectionState::Reconnecting)
    })
    .await;

    let first_receipt = client.send_message("m", json!({"n": 1})).await.unwrap();
    let second_receipt = client.send_message("m", json!({"n": 2})).await.unwrap();
    let third_receipt = client.send_message("m", json!({"n": 3})).await.unwrap();

    wait_until(|| async { client.state().await == ConnectionState::Connected }).await;
    second.expect_subscribe().await;
    for expected in 1..=3 {
        let message = second.next_json().await;
        assert_eq!(message["type"], "publish");
        assert_eq!(message["data"]["event"]["data"]["n"], expected);
    }
    assert_ok!(first_receipt.delivered().await);
    assert_ok!(second_receipt.delivered().await);
    assert_ok!(third_receipt.delivered().await);
}

#[tokio::test(start_paused = true)]
async fn test_normal_close_does_not_reconnect() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let mut peer = sockets.accept_next();
    let mut config = test_config();
    config.preferred_protocol = Protocol::WebSocket;
    let client = build(config, &streams, &sockets);

    assert!(client.connect().await);
    peer.expect_subscribe().await;

    peer.close(1000, "done");
    wait_until(|| async { client.state().await == ConnectionState::Disconnected }).await;

    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    assert_eq!(sockets.dials(), 1);
    let err = client.send_message("x", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_manual_switch_and_same_protocol_noop() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let _frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);
    let switches = record_switches(&client).await;

    assert!(client.connect().await);

    // Switching to the protocol already in use does nothing.
    assert!(client.switch_protocol(Protocol::Sse, "prefer stream").await);
    assert!(switches.lock().unwrap().is_empty());
    assert_eq!(client.stats().await.protocol_switches, 0);
    assert_eq!(streams.dials(), 1);

    let mut peer = sockets.accept_next();
    assert!(
        client
            .switch_protocol(Protocol::WebSocket, "operator request")
            .await
    );
    assert_eq!(client.active_protocol().await, Some(Protocol::WebSocket));
    peer.expect_subscribe().await;

    let recorded = switches.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].from, Protocol::Sse);
    assert_eq!(recorded[0].to, Protocol::WebSocket);
    assert_eq!(recorded[0].reason, "operator request");
    assert_eq!(client.stats().await.protocol_switches, 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_failure_schedules_protocol_fallback() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let frames = streams.accept_next();
    let mut peer = sockets.accept_next();
    let client = build(test_config(), &streams, &sockets);
    let switches = record_switches(&client).await;

    assert!(client.connect().await);
    frames
        .send(Err(ClientError::Connection("wire cut".to_string())))
        .unwrap();

    // Redials keep refusing; the fallback timer (5s) wins.
    wait_until(|| async { client.active_protocol().await == Some(Protocol::WebSocket) }).await;
    peer.expect_subscribe().await;
    assert_eq!(client.state().await, ConnectionState::Connected);

    let recorded = switches.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].from, Protocol::Sse);
    assert_eq!(recorded[0].to, Protocol::WebSocket);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_scheduled_fallback() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);
    let switches = record_switches(&client).await;

    assert!(client.connect().await);
    frames
        .send(Err(ClientError::Connection("wire cut".to_string())))
        .unwrap();
    wait_until(|| async { client.stats().await.recent_failures >= 1 }).await;

    client.disconnect().await;
    tokio::time::sleep(std::time::Duration::from_secs(30)).await;

    assert!(switches.lock().unwrap().is_empty());
    assert_eq!(sockets.dials(), 0);
    assert_eq!(client.state().await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_network_outage_holds_reconnect_until_restored() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let _first = streams.accept_next();
    let mut config = test_config();
    config.fallback_enabled = false;
    let client = build(config, &streams, &sockets);

    assert!(client.connect().await);
    client.set_network_available(false);
    wait_until(|| async { client.state().await == ConnectionState::Disconnected }).await;

    // With the network down no redial happens, no matter how long we wait.
    tokio::time::sleep(std::time::Duration::from_secs(120)).await;
    assert_eq!(streams.dials(), 1);

    let _second = streams.accept_next();
    client.set_network_available(true);
    wait_until(|| async { client.state().await == ConnectionState::Connected }).await;
    assert_eq!(streams.dials(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_network_outage_resumes_with_fallback_enabled() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let _first = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);
    let switches = record_switches(&client).await;

    assert!(client.connect().await);
    client.set_network_available(false);
    wait_until(|| async { client.state().await == ConnectionState::Disconnected }).await;

    // An outage is not a protocol problem: no fallback fires, nothing
    // dials, and the failure window stays clean.
    tokio::time::sleep(std::time::Duration::from_secs(120)).await;
    assert_eq!(streams.dials(), 1);
    assert_eq!(sockets.dials(), 0);
    assert!(switches.lock().unwrap().is_empty());
    assert_eq!(client.stats().await.recent_failures, 0);

    let _second = streams.accept_next();
    client.set_network_available(true);
    wait_until(|| async { client.state().await == ConnectionState::Connected }).await;
    assert_eq!(client.active_protocol().await, Some(Protocol::Sse));
    assert_eq!(streams.dials(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_not_resumed_by_network_edge() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let _first = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    assert!(client.connect().await);
    client.disconnect().await;

    client.set_network_available(false);
    client.set_network_available(true);
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    assert_eq!(streams.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ping_round_trip_latency() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let mut peer = sockets.accept_next();
    let mut config = test_config();
    config.preferred_protocol = Protocol::WebSocket;
    let client = build(config, &streams, &sockets);

    assert!(client.connect().await);
    peer.expect_subscribe().await;

    let (latency, ()) = tokio::join!(client.ping(), async {
        let message = peer.next_json().await;
        assert_eq!(message["type"], "ping");
        let id = message["data"]["id"].as_str().unwrap().to_string();
        peer.send_json(json!({"type": "pong", "data": {"ping_id": id}}));
    });
    latency.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_latency_tracks_processing_not_frame_timestamps() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    assert!(client.connect().await);
    // A stale server timestamp must not show up as seconds of latency.
    frames
        .send(Ok(pulselink::protocol::SseFrame {
            event: "heartbeat".to_string(),
            data: json!({"connection_id": "c-1", "timestamp": "2020-01-01T00:00:00"})
                .to_string(),
            id: None,
        }))
        .unwrap();
    frames
        .send(Ok(event_frame("task_update", json!({"n": 1}))))
        .unwrap();

    wait_until(|| async { client.stats().await.sse.events_received == 1 }).await;
    let stats = client.stats().await;
    // One sample per parsed frame, heartbeat included.
    assert!(stats.sse.average_latency_ms < 1000.0);
    assert!(client.health().await.healthy);
}

#[tokio::test(start_paused = true)]
async fn test_failure_burst_flags_health() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let frames = streams.accept_next();
    let mut config = test_config();
    config.fallback_enabled = false;
    let client = build(config, &streams, &sockets);

    assert!(client.connect().await);
    frames
        .send(Err(ClientError::Connection("wire cut".to_string())))
        .unwrap();

    // Every refused redial records another failure; five within the last
    // minute crosses the default threshold.
    tokio::time::sleep(std::time::Duration::from_secs(50)).await;
    wait_until(|| async {
        client
            .health()
            .await
            .issues
            .iter()
            .any(|issue| issue.contains("connection failures"))
    })
    .await;
    let report = client.health().await;
    assert!(!report.healthy);
    assert!(report.recent_failures >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_drop_ratio_flags_health() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let frames = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    let seen = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&seen);
    client
        .add_event_listener(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        })
        .await;

    assert!(client.connect().await);
    frames
        .send(Ok(event_frame("task_update", json!({"n": 1}))))
        .unwrap();
    frames
        .send(Ok(pulselink::protocol::SseFrame {
            event: "task_update".to_string(),
            data: "garbage".to_string(),
            id: None,
        }))
        .unwrap();

    wait_until(|| async { client.stats().await.sse.events_dropped == 1 }).await;
    let report = client.health().await;
    assert!(!report.healthy);
    assert!(report.issues.iter().any(|issue| issue.contains("dropped")));
}

#[tokio::test(start_paused = true)]
async fn test_update_config_reconnects_live_session() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let _first = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    assert!(client.connect().await);
    let _second = streams.accept_next();

    let update = ConfigUpdate {
        channels: Some(vec!["alerts".to_string()]),
        ..Default::default()
    };
    assert!(client.update_config(update).await);
    assert_eq!(streams.dials(), 2);
    assert_eq!(client.config().await.channels, vec!["alerts"]);
    assert_eq!(client.state().await, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_drops_listeners() {
    init_tracing();
    let streams = ScriptedStreams::new();
    let sockets = ScriptedSockets::new();
    let _first = streams.accept_next();
    let client = build(test_config(), &streams, &sockets);

    let seen = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&seen);
    client
        .add_event_listener(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        })
        .await;

    assert!(client.connect().await);
    client.destroy().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    // A fresh session delivers to nobody.
    let frames = streams.accept_next();
    assert!(client.connect().await);
    frames
        .send(Ok(event_frame("task_update", json!({"n": 1}))))
        .unwrap();
    wait_until(|| async { client.stats().await.sse.events_received == 1 }).await;
    assert_eq!(*seen.lock().unwrap(), 0);
}
