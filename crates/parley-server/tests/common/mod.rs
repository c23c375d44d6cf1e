//! Common test utilities for server integration tests.
//!
//! Each test starts its own server on an ephemeral port with in-memory
//! stores, then talks to it over real HTTP and WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use parley_protocol::{ClientEvent, PresenceStatus, ServerEvent, StatusChange};
use parley_server::config::{Config, MEMORY_STORE_URL};
use parley_server::{serve, AppState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default timeout for test operations.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait before concluding that no event is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Initialize test logging. Safe to call more than once.
#[allow(dead_code)]
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parley=debug,tower_http=info")),
        )
        .with_test_writer()
        .try_init();
}

/// Run an async operation with a timeout.
pub async fn with_timeout<T, F>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("Test operation timed out")
}

/// A server running in the background of the current test.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    http: reqwest::Client,
}

impl TestServer {
    pub async fn start() -> Self {
        init_test_logging();

        let mut config = Config::default();
        config.port = 0;
        config.store.url = MEMORY_STORE_URL.to_string();
        config.auth.bcrypt_cost = 4;
        config.metrics.enabled = false;

        let state = Arc::new(AppState::from_config(config).await.unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(serve(listener, state.clone()));

        Self {
            addr,
            state,
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws{}", self.addr, query)
    }

    /// `GET` a path, returning the status code and JSON body.
    pub async fn get(&self, path: &str) -> (u16, Value) {
        let response = with_timeout(self.http.get(self.url(path)).send())
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// `POST` a JSON body to a path, returning the status code and JSON body.
    pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = with_timeout(self.http.post(self.url(path)).json(&body).send())
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[allow(dead_code)]
    pub async fn signup(&self, username: &str, password: &str) -> (u16, Value) {
        self.post(
            "/signup",
            json!({ "username": username, "password": password }),
        )
        .await
    }

    /// Open a JSON WebSocket client and consume its `connected` event.
    pub async fn connect(&self) -> TestClient {
        TestClient::connect(&self.ws_url("")).await
    }
}

/// A WebSocket client speaking JSON text frames.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub connection_id: String,
}

impl TestClient {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = with_timeout(connect_async(url)).await.unwrap();
        let mut client = Self {
            ws,
            connection_id: String::new(),
        };

        match client.recv().await {
            ServerEvent::Connected { connection_id, .. } => client.connection_id = connection_id,
            other => panic!("expected connected event, got {other:?}"),
        }
        client
    }

    pub async fn send(&mut self, event: &ClientEvent) {
        let text = serde_json::to_string(event).unwrap();
        self.send_raw(Message::Text(text)).await;
    }

    pub async fn send_raw(&mut self, message: Message) {
        with_timeout(self.ws.send(message)).await.unwrap();
    }

    /// Next server event, failing the test on timeout.
    pub async fn recv(&mut self) -> ServerEvent {
        with_timeout(self.next_event())
            .await
            .expect("connection closed")
    }

    /// Skip events until one matches `predicate`.
    pub async fn recv_until(&mut self, predicate: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            let event = self.recv().await;
            if predicate(&event) {
                return event;
            }
        }
    }

    /// Every event that arrives within [`QUIET_PERIOD`].
    pub async fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(QUIET_PERIOD, self.next_event()).await {
            events.push(event);
        }
        events
    }

    /// Register and wait for our own online announcement.
    pub async fn register(&mut self, username: &str) {
        self.send(&ClientEvent::register(username)).await;
        self.recv_until(|event| is_status(event, username, PresenceStatus::Online))
            .await;
    }

    pub async fn close(mut self) {
        let _ = with_timeout(self.ws.close(None)).await;
    }

    async fn next_event(&mut self) -> Option<ServerEvent> {
        while let Some(message) = self.ws.next().await {
            match message.ok()? {
                Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    }
}

/// Whether `event` announces `username` with `status`.
pub fn is_status(event: &ServerEvent, username: &str, status: PresenceStatus) -> bool {
    matches!(
        event,
        ServerEvent::UserStatus(StatusChange { username: name, status: s })
            if name == username && *s == status
    )
}
