//! End-to-end flows over real WebSocket clients against the in-memory backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use cumbia_relay::backend::{BackendSession, InMemoryBackend};
use cumbia_relay::config::RelayConfig;
use cumbia_relay::registry::ConnectionRegistry;
use cumbia_relay::relay::SignalingRelay;
use cumbia_relay::server::RelayServer;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestRelay {
    addr: SocketAddr,
    server: Arc<RelayServer>,
    _dir: tempfile::TempDir,
}

/// Boot a relay on an ephemeral port.
async fn boot_relay() -> TestRelay {
    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig {
        port: 0,
        in_memory: true,
        audio_dir: dir.path().join("audios"),
        upload_tmp_dir: Some(dir.path().join("uploads")),
        ..RelayConfig::default()
    };
    let session = Arc::new(BackendSession::new(
        Arc::new(InMemoryBackend::new()),
        Duration::from_secs(2),
    ));
    let relay =
        Arc::new(SignalingRelay::new(Arc::new(ConnectionRegistry::new()), session).unwrap());
    let server = Arc::new(RelayServer::new(config, relay));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestRelay {
        addr,
        server,
        _dir: dir,
    }
}

/// Connect and consume the `connected` greeting.
async fn connect(relay: &TestRelay) -> WsStream {
    let (mut ws, _) = connect_async(format!("ws://{}/ws", relay.addr))
        .await
        .unwrap();
    let hello = next_event(&mut ws).await;
    assert_eq!(hello["event"], "connected");
    assert!(hello["data"]["connectionId"].is_string());
    ws
}

async fn send(ws: &mut WsStream, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    ws.send(Message::Text(frame)).await.unwrap();
}

async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Skip events until one named `name` arrives.
async fn wait_for(ws: &mut WsStream, name: &str) -> Value {
    loop {
        let event = next_event(ws).await;
        if event["event"] == name {
            return event["data"].clone();
        }
    }
}

async fn login(ws: &mut WsStream, name: &str) {
    send(ws, "login", json!({ "username": name })).await;
    let resp = wait_for(ws, "login_response").await;
    assert_eq!(resp["success"], true, "login failed: {resp}");
    assert_eq!(resp["username"], name);
}

/// Wait for a presence update that lists exactly `expected`.
async fn wait_for_users(ws: &mut WsStream, expected: &[&str]) {
    loop {
        let users = wait_for(ws, "users_list").await;
        let mut names: Vec<String> = serde_json::from_value(users).unwrap();
        names.sort();
        if names == expected {
            return;
        }
    }
}

#[tokio::test]
async fn ana_and_beto_chat_in_general() {
    let relay = boot_relay().await;
    let mut ana = connect(&relay).await;
    let mut beto = connect(&relay).await;

    login(&mut ana, "ana").await;
    login(&mut beto, "beto").await;
    wait_for_users(&mut ana, &["ana", "beto"]).await;

    send(
        &mut ana,
        "send_message",
        json!({"content": "hola beto", "sender": "ana", "groupName": "general", "type": "TEXT"}),
    )
    .await;

    let msg = wait_for(&mut beto, "receive_message").await;
    assert_eq!(msg["sender"], "ana");
    assert_eq!(msg["content"], "hola beto");
    assert_eq!(msg["groupName"], "general");
    assert_eq!(msg["type"], "TEXT");

    let echo = wait_for(&mut ana, "receive_message").await;
    assert_eq!(echo["content"], "hola beto");
}

#[tokio::test]
async fn private_message_reaches_peer_room() {
    let relay = boot_relay().await;
    let mut ana = connect(&relay).await;
    let mut beto = connect(&relay).await;
    let mut caro = connect(&relay).await;
    login(&mut ana, "ana").await;
    login(&mut beto, "beto").await;
    login(&mut caro, "caro").await;

    send(
        &mut ana,
        "send_message",
        json!({"content": "solo para ti", "sender": "ana", "groupName": "beto"}),
    )
    .await;
    let msg = wait_for(&mut beto, "receive_message").await;
    assert_eq!(msg["content"], "solo para ti");

    // A later broadcast proves caro's stream skipped the private one.
    send(
        &mut ana,
        "send_message",
        json!({"content": "para todos", "sender": "ana", "groupName": "general"}),
    )
    .await;
    let msg = wait_for(&mut caro, "receive_message").await;
    assert_eq!(msg["content"], "para todos");
}

#[tokio::test]
async fn groups_history_and_errors() {
    let relay = boot_relay().await;
    let mut ana = connect(&relay).await;

    ana.send(Message::Text(json!({"event": "get_groups"}).to_string()))
        .await
        .unwrap();
    assert_eq!(wait_for(&mut ana, "groups_list").await, json!(["general"]));

    send(&mut ana, "send_message", json!({"content": "x", "sender": "ana", "groupName": "general"})).await;
    let err = wait_for(&mut ana, "error").await;
    assert_eq!(err["code"], "NOT_LOGGED_IN");

    ana.send(Message::Text("{\"event\":\"bogus\"}".into()))
        .await
        .unwrap();
    assert_eq!(wait_for(&mut ana, "error").await["code"], "INVALID_PAYLOAD");

    login(&mut ana, "ana").await;
    send(&mut ana, "join_group", json!({"groupName": "nope", "username": "ana"})).await;
    assert_eq!(wait_for(&mut ana, "error").await["action"], "join_group");

    send(&mut ana, "send_message", json!({"content": "guardado", "sender": "ana", "groupName": "general"})).await;
    let _ = wait_for(&mut ana, "receive_message").await;
    send(&mut ana, "get_history", json!({"groupName": "general"})).await;
    let history = wait_for(&mut ana, "history").await;
    assert_eq!(history["groupName"], "general");
    assert_eq!(history["messages"][0]["content"], "guardado");
}

#[tokio::test]
async fn newer_login_takes_over_identity() {
    let relay = boot_relay().await;
    let mut first = connect(&relay).await;
    let mut second = connect(&relay).await;
    let mut beto = connect(&relay).await;
    login(&mut beto, "beto").await;

    login(&mut first, "ana").await;
    login(&mut second, "ana").await;
    let replaced = wait_for(&mut first, "session_replaced").await;
    assert_eq!(replaced["username"], "ana");

    // The stale socket going away must not unbind the newer one.
    first.close(None).await.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let registry = relay.server.state().relay.registry().clone();
    assert_eq!(registry.len(), 2);

    send(&mut beto, "send_message", json!({"content": "sigues ahi?", "sender": "beto", "groupName": "general"})).await;
    let msg = wait_for(&mut second, "receive_message").await;
    assert_eq!(msg["content"], "sigues ahi?");
}

#[tokio::test]
async fn call_setup_is_relayed_point_to_point() {
    let relay = boot_relay().await;
    let mut ana = connect(&relay).await;
    let mut beto = connect(&relay).await;
    login(&mut ana, "ana").await;
    login(&mut beto, "beto").await;

    let offer = json!({"type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0"});
    send(&mut ana, "call_request", json!({"to": "beto", "from": "ana", "offer": offer})).await;
    let incoming = wait_for(&mut beto, "incoming_call").await;
    assert_eq!(incoming["from"], "ana");
    assert_eq!(incoming["offer"], offer);

    let answer = json!({"type": "answer", "sdp": "v=0"});
    send(&mut beto, "call_accept", json!({"to": "ana", "from": "beto", "answer": answer})).await;
    let accepted = wait_for(&mut ana, "call_accepted").await;
    assert_eq!(accepted["answer"], answer);

    let candidate = json!({"candidate": "candidate:1 1 UDP 2122260223 10.0.0.2 54400 typ host", "sdpMid": "0"});
    send(&mut ana, "ice_candidate", json!({"to": "beto", "from": "ana", "candidate": candidate})).await;
    assert_eq!(wait_for(&mut beto, "ice_candidate").await["candidate"], candidate);

    send(&mut beto, "call_end", json!({"to": "ana", "from": "beto"})).await;
    assert_eq!(wait_for(&mut ana, "call_ended").await["from"], "beto");

    send(&mut ana, "call_request", json!({"to": "nadie", "from": "ana", "offer": offer})).await;
    let failed = wait_for(&mut ana, "call_failed").await;
    assert_eq!(failed["to"], "nadie");
    assert_eq!(failed["reason"], "callee unavailable");
}

#[tokio::test]
async fn disconnect_updates_presence() {
    let relay = boot_relay().await;
    let mut ana = connect(&relay).await;
    let mut beto = connect(&relay).await;
    login(&mut ana, "ana").await;
    login(&mut beto, "beto").await;
    wait_for_users(&mut ana, &["ana", "beto"]).await;

    beto.close(None).await.unwrap();
    drop(beto);
    wait_for_users(&mut ana, &["ana"]).await;

    let registry = relay.server.state().relay.registry().clone();
    assert_eq!(registry.identities(), vec!["ana".to_string()]);
}

#[tokio::test]
async fn uploaded_audio_is_announced_to_group() {
    let relay = boot_relay().await;
    let mut ana = connect(&relay).await;
    login(&mut ana, "ana").await;

    let boundary = "flow-boundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"sender\"\r\n\r\nana\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"groupName\"\r\n\r\ngeneral\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"nota.webm\"\r\n\
         Content-Type: audio/webm\r\n\r\nOGGS\r\n--{boundary}--\r\n"
    );
    let req = Request::builder()
        .method("POST")
        .uri("/api/messages/group/audio")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let resp = relay.server.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let msg = wait_for(&mut ana, "receive_message").await;
    assert_eq!(msg["type"], "AUDIO");
    assert!(msg["content"].as_str().unwrap().starts_with("/audios/"));
}
