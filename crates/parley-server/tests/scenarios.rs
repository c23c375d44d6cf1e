//! End-to-end tests against a running server.
//!
//! ```bash
//! cargo test -p parley-server --test scenarios
//! ```

mod common;

use bytes::BytesMut;
use common::{is_status, with_timeout, TestClient, TestServer};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{codec, ClientEvent, PresenceStatus, ServerEvent};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;

type PackedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn is_message(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::ReceiveMessage { .. })
}

#[tokio::test]
async fn test_signup_twice_is_rejected() {
    let server = TestServer::start().await;

    let (status, body) = server.signup("alice", "secret").await;
    assert_eq!(status, 201);
    assert_eq!(body, json!({ "message": "User created", "username": "alice" }));

    let (status, body) = server.signup("alice", "other").await;
    assert_eq!(status, 400);
    assert_eq!(body, json!({ "message": "Username already taken" }));
}

#[tokio::test]
async fn test_signup_after_socket_register() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    alice.register("alice").await;
    alice.close().await;

    let (status, body) = server.signup("alice", "secret").await;
    assert_eq!(status, 201);
    assert_eq!(body, json!({ "message": "User created", "username": "alice" }));

    let (status, _) = login(&server, "alice", "secret").await;
    assert_eq!(status, 200);

    // The claimed name is now taken like any other.
    let (status, _) = server.signup("alice", "again").await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_signup_rejects_invalid_input() {
    let server = TestServer::start().await;

    let (status, body) = server.signup("", "secret").await;
    assert_eq!(status, 400);
    assert!(body["message"].is_string());

    let (status, _) = server.signup("alice", "").await;
    assert_eq!(status, 400);

    let (status, _) = server.post("/signup", json!({ "username": "alice" })).await;
    assert_eq!(status, 400);
}

async fn login(server: &TestServer, username: &str, password: &str) -> (u16, serde_json::Value) {
    server
        .post("/login", json!({ "username": username, "password": password }))
        .await
}

#[tokio::test]
async fn test_login() {
    let server = TestServer::start().await;
    server.signup("alice", "secret").await;

    let (status, body) = login(&server, "alice", "secret").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "message": "Login successful", "username": "alice" }));

    let (status, body) = login(&server, "alice", "wrong").await;
    assert_eq!(status, 401);
    assert_eq!(body, json!({ "message": "Invalid credentials" }));

    let (status, body) = login(&server, "nobody", "secret").await;
    assert_eq!(status, 404);
    assert_eq!(body, json!({ "message": "User not found" }));
}

#[tokio::test]
async fn test_registered_recipient_receives_message() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;
    alice.register("alice").await;
    bob.register("bob").await;

    bob.send(&ClientEvent::send_message("bob", "alice", "hi alice"))
        .await;

    let event = alice.recv_until(is_message).await;
    assert_eq!(event, ServerEvent::receive_message("bob", "hi alice"));
    assert!(
        !alice.drain().await.iter().any(is_message),
        "message delivered more than once"
    );

    let (status, history) = server.get("/messages/alice/bob").await;
    assert_eq!(status, 200);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["from"], "bob");
    assert_eq!(history[0]["to"], "alice");
    assert_eq!(history[0]["message"], "hi alice");
}

#[tokio::test]
async fn test_offline_recipient_still_gets_history() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;
    alice.register("alice").await;
    bob.register("bob").await;

    alice.close().await;
    bob.recv_until(|e| is_status(e, "alice", PresenceStatus::Offline))
        .await;

    bob.send(&ClientEvent::send_message("bob", "alice", "you there?"))
        .await;

    // History is written before delivery, so once it shows up the send is done.
    let history = with_timeout(async {
        loop {
            let (_, history) = server.get("/messages/bob/alice").await;
            if !history.as_array().unwrap().is_empty() {
                return history;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await;
    assert_eq!(history[0]["message"], "you there?");

    let (status, body) = server.get("/status/alice").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "status": "offline" }));
}

#[tokio::test]
async fn test_reconnect_stays_online() {
    let server = TestServer::start().await;
    let mut watcher = server.connect().await;

    let mut first = server.connect().await;
    first.register("alice").await;
    first.close().await;
    watcher
        .recv_until(|e| is_status(e, "alice", PresenceStatus::Offline))
        .await;

    let mut second = server.connect().await;
    second.register("alice").await;

    let (status, body) = server.get("/status/alice").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "status": "online" }));
}

#[tokio::test]
async fn test_superseded_connection_close_keeps_user_online() {
    let server = TestServer::start().await;
    let mut bob = server.connect().await;
    bob.register("bob").await;

    let mut old = server.connect().await;
    old.register("alice").await;
    let mut new = server.connect().await;
    new.register("alice").await;

    old.close().await;
    let seen = bob.drain().await;
    assert!(
        !seen.iter().any(|e| is_status(e, "alice", PresenceStatus::Offline)),
        "stale disconnect announced alice offline"
    );

    let (_, body) = server.get("/status/alice").await;
    assert_eq!(body, json!({ "status": "online" }));

    bob.send(&ClientEvent::send_message("bob", "alice", "which one?"))
        .await;
    let event = new.recv_until(is_message).await;
    assert_eq!(event, ServerEvent::receive_message("bob", "which one?"));
}

#[tokio::test]
async fn test_history_is_symmetric() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;
    alice.register("alice").await;
    bob.register("bob").await;

    alice.send(&ClientEvent::send_message("alice", "bob", "one")).await;
    bob.recv_until(is_message).await;
    bob.send(&ClientEvent::send_message("bob", "alice", "two")).await;
    alice.recv_until(is_message).await;

    let (_, forward) = server.get("/messages/alice/bob").await;
    let (_, backward) = server.get("/messages/bob/alice").await;
    assert_eq!(forward, backward);

    let bodies: Vec<_> = forward
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(bodies, ["one", "two"]);
}

#[tokio::test]
async fn test_typing_reaches_only_recipient() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;
    let mut carol = server.connect().await;
    alice.register("alice").await;
    bob.register("bob").await;
    carol.register("carol").await;

    bob.send(&ClientEvent::typing("bob", "alice")).await;

    let event = alice
        .recv_until(|e| matches!(e, ServerEvent::Typing { .. }))
        .await;
    assert_eq!(event, ServerEvent::typing("bob"));
    assert!(!carol
        .drain()
        .await
        .iter()
        .any(|e| matches!(e, ServerEvent::Typing { .. })));
}

#[tokio::test]
async fn test_status_and_user_lookups() {
    let server = TestServer::start().await;

    assert_eq!(
        server.get("/status/ghost").await,
        (404, json!({ "status": "offline" }))
    );
    assert_eq!(
        server.get("/user/ghost").await,
        (409, json!({ "user": "user not found" }))
    );

    server.signup("alice", "secret").await;
    assert_eq!(
        server.get("/status/alice").await,
        (200, json!({ "status": "offline" }))
    );
    assert_eq!(
        server.get("/user/alice").await,
        (200, json!({ "user": "exists" }))
    );
}

#[tokio::test]
async fn test_health_counts_connections() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    alice.register("alice").await;
    let _idle = server.connect().await;

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 2);
    assert_eq!(body["online"], 1);
    assert_eq!(server.state.relay.registry().len(), 1);
}

#[tokio::test]
async fn test_malformed_frame_gets_error_event() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.send_raw(Message::Text("{\"event\":\"nope\"}".to_string())).await;
    match client.recv().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, 1001),
        other => panic!("expected error event, got {other:?}"),
    }

    // The connection survives.
    client.register("alice").await;
}

/// Next event from a MessagePack connection.
async fn next_packed(ws: &mut PackedSocket, buffer: &mut BytesMut) -> ServerEvent {
    loop {
        if let Some(event) = codec::decode_from::<ServerEvent>(buffer).unwrap() {
            return event;
        }
        if let Message::Binary(data) = with_timeout(ws.next()).await.unwrap().unwrap() {
            buffer.extend_from_slice(&data);
        }
    }
}

#[tokio::test]
async fn test_msgpack_connection() {
    let server = TestServer::start().await;
    let mut bob = server.connect().await;
    bob.register("bob").await;

    let (mut ws, _) = with_timeout(connect_async(server.ws_url("?encoding=msgpack&version=1")))
        .await
        .unwrap();

    let mut buffer = BytesMut::new();

    assert!(matches!(next_packed(&mut ws, &mut buffer).await, ServerEvent::Connected { .. }));

    let register = codec::encode(&ClientEvent::register("alice")).unwrap();
    ws.send(Message::Binary(register.to_vec())).await.unwrap();
    bob.recv_until(|e| is_status(e, "alice", PresenceStatus::Online))
        .await;

    bob.send(&ClientEvent::send_message("bob", "alice", "packed"))
        .await;
    loop {
        if let ServerEvent::ReceiveMessage { from, message } = next_packed(&mut ws, &mut buffer).await {
            assert_eq!(from, "bob");
            assert_eq!(message, "packed");
            break;
        }
    }
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    let server = TestServer::start().await;
    let result = connect_async(server.ws_url("?version=99")).await;
    assert!(result.is_err());

    // Compatible version still works.
    let client = TestClient::connect(&server.ws_url("?version=1")).await;
    assert!(client.connection_id.starts_with("conn_"));
}
