//! End-to-end tests: real server on an ephemeral port, real websocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use scanlink_server::{start, RelayConfig, ServerHandle};
use scanlink_store::{Database, SqliteSessionStore};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn boot() -> ServerHandle {
    boot_with(RelayConfig::default()).await
}

async fn boot_with(config: RelayConfig) -> ServerHandle {
    let config = RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..config
    };
    let store = SqliteSessionStore::new(Database::in_memory().unwrap());
    start(&config, Arc::new(store)).await.unwrap()
}

async fn open(handle: &ServerHandle, code: &str, role: &str) -> WsStream {
    let url = format!("ws://127.0.0.1:{}/ws/remote-scanner/{code}/{role}", handle.port);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Next JSON text frame, skipping transport-level ping/pong.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Wait for the server to close the socket; returns the close code if sent.
async fn expect_closed(ws: &mut WsStream) -> Option<u16> {
    loop {
        let next = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn get_json(handle: &ServerHandle, path: &str) -> Value {
    let url = format!("http://127.0.0.1:{}{path}", handle.port);
    reqwest::get(&url).await.unwrap().json().await.unwrap()
}

/// Poll until the live table reports `expected` connections.
async fn wait_for_connections(handle: &ServerHandle, expected: usize) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while handle.relay().table().len() != expected {
        assert!(tokio::time::Instant::now() < deadline, "connection count never reached {expected}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn host_and_client_pair_and_relay_a_scan() {
    let handle = boot().await;

    let mut host = open(&handle, "482913", "host").await;
    let connected = next_json(&mut host).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["session_id"], "482913");
    assert_eq!(connected["device_type"], "host");

    let mut client = open(&handle, "482913", "client").await;
    let host_status = next_json(&mut host).await;
    assert_eq!(host_status["type"], "status");
    assert_eq!(host_status["status"], "client_connected");

    let client_connected = next_json(&mut client).await;
    assert_eq!(client_connected["type"], "connected");
    assert_eq!(client_connected["device_type"], "client");
    assert_eq!(next_json(&mut client).await["status"], "host_already_connected");

    send_json(
        &mut client,
        json!({"type": "scan", "qr_content": "INV-00042", "timestamp": "2024-05-01T10:00:00Z"}),
    )
    .await;
    let scan = next_json(&mut host).await;
    assert_eq!(scan["type"], "scan");
    assert_eq!(scan["qr_content"], "INV-00042");
    assert_eq!(scan["device_type"], "client");
    assert!(scan["timestamp"].is_string());

    client.close(None).await.unwrap();
    let goodbye = next_json(&mut host).await;
    assert_eq!(goodbye["type"], "status");
    assert_eq!(goodbye["status"], "client_disconnected");

    wait_for_connections(&handle, 1).await;
    let status = get_json(&handle, "/api/sessions/482913/status").await;
    assert_eq!(status["exists"], true);
    assert_eq!(status["active"], true);
    assert_eq!(status["host_connected"], true);
    assert_eq!(status["client_connected"], false);

    handle.shutdown();
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let handle = boot().await;
    let mut host = open(&handle, "PING01", "host").await;
    next_json(&mut host).await;

    send_json(&mut host, json!({"type": "ping", "timestamp": "2024-05-01T10:00:00Z"})).await;
    assert_eq!(next_json(&mut host).await["type"], "pong");
    handle.shutdown();
}

#[tokio::test]
async fn invalid_role_is_closed_with_policy_violation() {
    let handle = boot().await;

    let mut watcher = open(&handle, "482913", "watcher").await;
    assert_eq!(expect_closed(&mut watcher).await, Some(1008));

    let live = get_json(&handle, "/ws/sessions/482913/status").await;
    assert_eq!(live["active"], false);
    assert_eq!(live["devices"], json!([]));

    let durable = get_json(&handle, "/api/sessions/482913/status").await;
    assert_eq!(durable["exists"], false);
    assert!(handle.relay().table().is_empty());

    handle.shutdown();
}

#[tokio::test]
async fn invalid_code_is_closed_with_policy_violation() {
    let handle = boot().await;
    let mut host = open(&handle, "12", "host").await;
    assert_eq!(expect_closed(&mut host).await, Some(1008));
    assert_eq!(get_json(&handle, "/api/sessions/active/list").await["count"], 0);
    handle.shutdown();
}

#[tokio::test]
async fn reconnecting_client_evicts_the_old_socket() {
    let handle = boot().await;

    let mut host = open(&handle, "EVICT1", "host").await;
    next_json(&mut host).await;

    let mut first = open(&handle, "EVICT1", "client").await;
    next_json(&mut first).await;
    assert_eq!(next_json(&mut host).await["status"], "client_connected");

    let mut second = open(&handle, "EVICT1", "client").await;
    assert_eq!(next_json(&mut second).await["type"], "connected");
    assert_eq!(next_json(&mut host).await["status"], "client_connected");
    expect_closed(&mut first).await;

    // The evicted socket's teardown must not announce a disconnect.
    next_json(&mut second).await;
    send_json(&mut second, json!({"type": "scan", "qr_content": "after-evict"})).await;
    let next = next_json(&mut host).await;
    assert_eq!(next["type"], "scan");
    assert_eq!(next["qr_content"], "after-evict");

    wait_for_connections(&handle, 2).await;
    handle.shutdown();
}

#[tokio::test]
async fn live_status_surface_reports_devices() {
    let handle = boot().await;
    let mut host = open(&handle, "LIVE01", "host").await;
    next_json(&mut host).await;
    let mut client = open(&handle, "LIVE01", "client").await;
    next_json(&mut client).await;

    let status = get_json(&handle, "/ws/sessions/LIVE01/status").await;
    assert_eq!(status["active"], true);
    assert_eq!(status["session_id"], "LIVE01");
    assert_eq!(status["devices"], json!(["host", "client"]));
    assert_eq!(status["host_connected"], true);
    assert_eq!(status["client_connected"], true);

    let all = get_json(&handle, "/ws/sessions").await;
    assert_eq!(all["total_sessions"], 1);
    assert_eq!(all["sessions"][0]["session_id"], "LIVE01");

    let health = get_json(&handle, "/health").await;
    assert_eq!(health["connections"], 2);
    assert_eq!(health["sessions"], 1);

    handle.shutdown();
}

#[tokio::test]
async fn rest_session_lifecycle() {
    let handle = boot().await;
    let http = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", handle.port);

    let created: Value = http
        .post(format!("{base}/api/sessions/create"))
        .json(&json!({"session_id": "ABC123"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["success"], true);
    assert_eq!(created["session_id"], "ABC123");
    assert_eq!(created["created"], true);

    let again: Value = http
        .post(format!("{base}/api/sessions/create"))
        .json(&json!({"session_id": "ABC123"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["existing"], true);

    let generated: Value = http
        .post(format!("{base}/api/sessions/create"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let code = generated["session_id"].as_str().unwrap();
    assert_eq!(code.len(), 6);
    assert!(code.bytes().all(|b| b.is_ascii_digit()));

    let bad = http
        .post(format!("{base}/api/sessions/create"))
        .json(&json!({"session_id": "no"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    let active = get_json(&handle, "/api/sessions/active/list").await;
    assert_eq!(active["count"], 2);

    let mut host = open(&handle, "ABC123", "host").await;
    next_json(&mut host).await;

    let disconnected: Value = http
        .post(format!("{base}/api/sessions/ABC123/disconnect"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(disconnected["success"], true);
    assert_eq!(disconnected["closed_connections"], 1);
    expect_closed(&mut host).await;

    wait_for_connections(&handle, 0).await;
    let status = get_json(&handle, "/api/sessions/ABC123/status").await;
    assert_eq!(status["exists"], true);
    assert_eq!(status["active"], false);
    assert_eq!(status["host_connected"], false);

    handle.shutdown();
}

#[tokio::test]
async fn idle_connection_is_pinged_not_closed() {
    let handle = boot_with(RelayConfig {
        idle_timeout_secs: 1,
        ..RelayConfig::default()
    })
    .await;

    let mut host = open(&handle, "IDLE01", "host").await;
    next_json(&mut host).await;

    let ping = next_json(&mut host).await;
    assert_eq!(ping["type"], "ping");
    assert_eq!(handle.relay().table().len(), 1);

    send_json(&mut host, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut host).await["type"], "pong");
    handle.shutdown();
}
