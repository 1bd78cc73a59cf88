use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetdeck_gateway::auth::{hash_api_key, mint_session_token};
use fleetdeck_gateway::buffer::MemoryOutputBuffer;
use fleetdeck_gateway::config::Config;
use fleetdeck_gateway::protocol::encode_payload;
use fleetdeck_gateway::proxy::ProxyState;
use fleetdeck_gateway::state::GatewayState;
use fleetdeck_gateway::store::{ApiKeyRecord, MemoryStore, RelayStore};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const AGENT_KEY: &str = "fd_live_integration";
const SECRET: &str = "fleetdeck-dev-secret";

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_gateway() -> SocketAddr {
    let cfg = Config::default();
    let store = Arc::new(MemoryStore::new());
    store
        .put_api_key(ApiKeyRecord {
            key_hash: hash_api_key(AGENT_KEY),
            owner_id: "u1".to_string(),
            label: Some("integration".to_string()),
            expires_at: None,
            revoked: false,
            last_used_at: None,
        })
        .await
        .unwrap();
    let buffer = Arc::new(MemoryOutputBuffer::new(cfg.output_max_lines, cfg.output_ttl));
    let state = GatewayState::new(&cfg, store, buffer);
    // These tests never touch the proxied application.
    let proxy = ProxyState::new("127.0.0.1".to_string(), 9);
    let app = fleetdeck_gateway::app(state, proxy);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect_agent(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws/agent?token={AGENT_KEY}"))
        .await
        .unwrap();
    ws
}

async fn connect_dashboard(addr: SocketAddr, user: &str) -> WsClient {
    let token = mint_session_token(SECRET, user, chrono::Duration::minutes(5)).unwrap();
    let (ws, _) = connect_async(format!("ws://{addr}/ws/dashboard?token={token}"))
        .await
        .unwrap();
    // The server-side connection task sets up the event subscription just
    // after the handshake; give it a beat so no event published next is
    // missed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    ws
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let message = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn expect_silence(ws: &mut WsClient) {
    let outcome = timeout(Duration::from_millis(300), ws.next()).await;
    assert!(outcome.is_err(), "expected no event, got {:?}", outcome);
}

fn register(machine_id: &str) -> Value {
    json!({
        "type": "register",
        "machineId": machine_id,
        "name": "build box",
        "os": "linux",
        "hostname": "build-box-1",
        "version": "1.4.2",
    })
}

#[tokio::test]
async fn register_fans_out_online_status() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;

    let event = next_json(&mut dashboard).await;
    assert_eq!(event["type"], "machine_updated");
    assert_eq!(event["machine"]["id"], "m1");
    assert_eq!(event["machine"]["status"], "online");
}

#[tokio::test]
async fn replayed_register_is_idempotent() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;
    send_json(&mut agent, register("m1")).await;

    for _ in 0..2 {
        let event = next_json(&mut dashboard).await;
        assert_eq!(event["type"], "machine_updated");
        assert_eq!(event["machine"]["status"], "online");
    }
}

#[tokio::test]
async fn heartbeat_carries_reported_telemetry() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;
    let _online = next_json(&mut dashboard).await;

    send_json(
        &mut agent,
        json!({
            "type": "heartbeat",
            "machineId": "m1",
            "cpu": 90.0,
            "memory": 70.0,
            "disk": 40.0,
            "sessionCount": 2,
        }),
    )
    .await;

    let event = next_json(&mut dashboard).await;
    assert_eq!(event["type"], "machine_updated");
    assert_eq!(event["machine"]["status"], "online");
    assert_eq!(event["machine"]["cpu"], 90.0);
    assert_eq!(event["machine"]["memory"], 70.0);
}

#[tokio::test]
async fn events_stay_within_their_owner() {
    let addr = spawn_gateway().await;
    let mut other = connect_dashboard(addr, "u2").await;
    let mut mine = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;

    let event = next_json(&mut mine).await;
    assert_eq!(event["type"], "machine_updated");
    expect_silence(&mut other).await;
}

#[tokio::test]
async fn double_stop_publishes_once() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;
    let _online = next_json(&mut dashboard).await;

    send_json(
        &mut agent,
        json!({
            "type": "session_started",
            "session": {
                "id": "s1",
                "pid": 4242,
                "processName": "bash",
                "workdir": "/home/dev",
                "startedAt": "2026-08-06T10:00:00Z",
            },
        }),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "session_started");

    send_json(
        &mut agent,
        json!({"type": "session_stopped", "sessionId": "s1", "exitCode": 0}),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "session_stopped");

    // The replay is absorbed; the next observable event is the heartbeat's
    // machine update, not a second stop.
    send_json(
        &mut agent,
        json!({"type": "session_stopped", "sessionId": "s1", "exitCode": 0}),
    )
    .await;
    send_json(
        &mut agent,
        json!({
            "type": "heartbeat",
            "machineId": "m1",
            "cpu": 1.0, "memory": 1.0, "disk": 1.0, "sessionCount": 0,
        }),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "machine_updated");
}

#[tokio::test]
async fn crash_fires_exactly_one_alert() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;
    let _online = next_json(&mut dashboard).await;

    send_json(
        &mut agent,
        json!({
            "type": "session_started",
            "session": {
                "id": "s2",
                "pid": 77,
                "processName": "node",
                "workdir": "/srv/app",
                "startedAt": "2026-08-06T10:00:00Z",
            },
        }),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "session_started");

    send_json(
        &mut agent,
        json!({"type": "session_crashed", "sessionId": "s2", "error": "segfault"}),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "session_crashed");
    let alert = next_json(&mut dashboard).await;
    assert_eq!(alert["type"], "alert_fired");
    assert_eq!(alert["severity"], "error");

    // A replayed crash is terminal-on-terminal: no second alert.
    send_json(
        &mut agent,
        json!({"type": "session_crashed", "sessionId": "s2", "error": "segfault"}),
    )
    .await;
    send_json(
        &mut agent,
        json!({
            "type": "heartbeat",
            "machineId": "m1",
            "cpu": 1.0, "memory": 1.0, "disk": 1.0, "sessionCount": 0,
        }),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "machine_updated");
}

#[tokio::test]
async fn output_is_fanned_out_and_replayable_from_history() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;
    let _online = next_json(&mut dashboard).await;

    send_json(
        &mut agent,
        json!({
            "type": "session_started",
            "session": {
                "id": "s3",
                "pid": 99,
                "processName": "bash",
                "workdir": "/home/dev",
                "startedAt": "2026-08-06T10:00:00Z",
            },
        }),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "session_started");

    let data = encode_payload(b"$ cargo test\n");
    send_json(
        &mut agent,
        json!({"type": "session_output", "sessionId": "s3", "data": data}),
    )
    .await;

    let live = next_json(&mut dashboard).await;
    assert_eq!(live["type"], "session_output");
    assert_eq!(live["data"], data);

    send_json(
        &mut dashboard,
        json!({"type": "fetch_history", "sessionId": "s3"}),
    )
    .await;
    let replayed = next_json(&mut dashboard).await;
    assert_eq!(replayed["type"], "session_output");
    assert_eq!(replayed["sessionId"], "s3");
    assert_eq!(replayed["data"], data);
}

#[tokio::test]
async fn close_produces_exactly_one_offline_transition() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;
    let _online = next_json(&mut dashboard).await;

    agent.close(None).await.unwrap();

    let event = next_json(&mut dashboard).await;
    assert_eq!(event["type"], "machine_updated");
    assert_eq!(event["machine"]["status"], "offline");
    expect_silence(&mut dashboard).await;
}

#[tokio::test]
async fn input_without_a_live_agent_is_silently_dropped() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;
    let _online = next_json(&mut dashboard).await;
    send_json(
        &mut agent,
        json!({
            "type": "session_started",
            "session": {
                "id": "s4",
                "pid": 11,
                "processName": "bash",
                "workdir": "/home/dev",
                "startedAt": "2026-08-06T10:00:00Z",
            },
        }),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "session_started");

    agent.close(None).await.unwrap();
    let offline = next_json(&mut dashboard).await;
    assert_eq!(offline["machine"]["status"], "offline");

    // No live agent connection for the owning machine: the command is
    // dropped and nothing is propagated back to the dashboard.
    send_json(
        &mut dashboard,
        json!({
            "type": "session_input",
            "sessionId": "s4",
            "data": encode_payload(b"ls\n"),
        }),
    )
    .await;
    expect_silence(&mut dashboard).await;

    // The dashboard connection itself is still healthy.
    let mut agent = connect_agent(addr).await;
    send_json(&mut agent, register("m1")).await;
    assert_eq!(next_json(&mut dashboard).await["type"], "machine_updated");
}

#[tokio::test]
async fn commands_reach_the_addressed_agent() {
    let addr = spawn_gateway().await;
    let mut dashboard = connect_dashboard(addr, "u1").await;
    let mut agent = connect_agent(addr).await;

    send_json(&mut agent, register("m1")).await;
    let _online = next_json(&mut dashboard).await;
    send_json(
        &mut agent,
        json!({
            "type": "session_started",
            "session": {
                "id": "s5",
                "pid": 12,
                "processName": "bash",
                "workdir": "/home/dev",
                "startedAt": "2026-08-06T10:00:00Z",
            },
        }),
    )
    .await;
    assert_eq!(next_json(&mut dashboard).await["type"], "session_started");

    let data = encode_payload(b"ls\n");
    send_json(
        &mut dashboard,
        json!({"type": "session_input", "sessionId": "s5", "data": data}),
    )
    .await;

    let command = next_json(&mut agent).await;
    assert_eq!(command["type"], "session_input");
    assert_eq!(command["sessionId"], "s5");
    assert_eq!(command["data"], data);
}

#[tokio::test]
async fn unauthenticated_upgrades_are_rejected_with_401() {
    let addr = spawn_gateway().await;

    for url in [
        format!("ws://{addr}/ws/agent"),
        format!("ws://{addr}/ws/agent?token=not-a-key"),
        format!("ws://{addr}/ws/dashboard"),
        format!("ws://{addr}/ws/dashboard?token=not-a-token"),
    ] {
        match connect_async(&url).await {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), 401, "unexpected status for {url}");
            }
            other => panic!("expected 401 rejection for {url}, got {other:?}"),
        }
    }
}
