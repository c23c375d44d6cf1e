//! Connection handlers for the Parley server.
//!
//! This module wires the HTTP routes together and drives each WebSocket
//! connection through its lifecycle.

use crate::api;
use crate::config::{Config, CorsConfig};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::store::memory::{MemoryConversationLog, MemoryIdentityStore};
use parley_core::{
    ConnectionId, ConversationLog, IdentityStore, Outcome, Relay, RelayConfig, RelayError, Session,
};
use parley_protocol::{
    codec, ClientEvent, Encoding, EventCodec, ProtocolError, ServerEvent, WireFrame,
    PROTOCOL_VERSION,
};
use parley_store::SqliteStore;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// `error` code for a frame that is not a valid event.
pub const ERROR_MALFORMED_EVENT: u16 = 1001;

/// `error` code for a binary frame whose length prefix exceeds the limit.
pub const ERROR_FRAME_TOO_LARGE: u16 = 1002;

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The relay engine, which also owns the stores.
    pub relay: Relay,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state over the given stores.
    #[must_use]
    pub fn new(
        config: Config,
        identities: Arc<dyn IdentityStore>,
        log: Arc<dyn ConversationLog>,
    ) -> Self {
        let relay_config = RelayConfig {
            broadcast_capacity: config.transport.broadcast_capacity,
        };

        Self {
            relay: Relay::with_config(relay_config, identities, log),
            config,
        }
    }

    /// Create app state, opening the stores named by `config.store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn from_config(config: Config) -> Result<Self> {
        if config.store.is_memory() {
            info!("Using in-memory stores");
            return Ok(Self::new(
                config,
                Arc::new(MemoryIdentityStore::new()),
                Arc::new(MemoryConversationLog::new()),
            ));
        }

        let store = SqliteStore::connect(&config.store.url, config.store.max_connections)
            .await
            .with_context(|| format!("Failed to open store at {}", config.store.url))?;
        if config.store.reset_presence_on_start {
            store
                .reset_presence()
                .await
                .context("Failed to reset presence flags")?;
        }

        let store = Arc::new(store);
        Ok(Self::new(config, store.clone(), store))
    }
}

/// Build the CORS layer for the configured origin.
fn cors_layer(cors: &CorsConfig) -> Result<CorsLayer> {
    let Some(origin) = &cors.allowed_origin else {
        return Ok(CorsLayer::permissive());
    };

    let origin: HeaderValue = origin
        .parse()
        .with_context(|| format!("Invalid CORS origin {origin}"))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true))
}

/// Build the application router.
///
/// # Errors
///
/// Returns an error if the CORS origin is not a valid header value.
pub fn app(state: Arc<AppState>) -> Result<Router> {
    let cors = cors_layer(&state.config.cors)?;

    Ok(Router::new()
        .route("/signup", post(api::signup))
        .route("/login", post(api::login))
        .route("/messages/:user1/:user2", get(api::messages))
        .route("/status/:username", get(api::status))
        .route("/user/:username", get(api::user))
        .route("/health", get(api::health))
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the router cannot be built or the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = app(state)?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::from_config(config).await?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Query parameters of the WebSocket upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Outbound encoding.
    #[serde(default)]
    pub encoding: Encoding,
    /// Protocol major version the client speaks.
    pub version: Option<u8>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !PROTOCOL_VERSION.accepts(params.version) {
        warn!(requested = ?params.version, "Rejected incompatible protocol version");
        return (
            StatusCode::BAD_REQUEST,
            format!("Unsupported protocol version, server speaks {PROTOCOL_VERSION}"),
        )
            .into_response();
    }

    let codec = EventCodec::new(params.encoding);
    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, codec))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, codec: EventCodec) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut session, mut outbox) = state.relay.connect();
    let connection_id = session.id().clone();
    debug!(connection = %connection_id, encoding = ?codec.encoding(), "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let connected = ServerEvent::connected(connection_id.as_str(), PROTOCOL_VERSION.to_string());
    if send_event(&mut sender, &codec, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send connected event");
        disconnect(&state, &mut session).await;
        return;
    }

    // Binary frames may split or batch length-prefixed events.
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            outbound = outbox.recv() => {
                let Some(event) = outbound else { break };
                if send_event(&mut sender, &codec, &event).await.is_err() {
                    break;
                }
            }

            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_frame(text.len(), "inbound");
                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => handle_event(&state, &mut session, event).await,
                            Err(e) => {
                                if reject_frame(&mut sender, &codec, &connection_id, ERROR_MALFORMED_EVENT, e)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        let mut failed = false;
                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => handle_event(&state, &mut session, event).await,
                                Ok(None) => break,
                                Err(e) => {
                                    let code = match &e {
                                        ProtocolError::FrameTooLarge(_) => {
                                            // The prefix can't be trusted, so neither can anything after it.
                                            read_buffer.clear();
                                            ERROR_FRAME_TOO_LARGE
                                        }
                                        _ => ERROR_MALFORMED_EVENT,
                                    };
                                    failed = reject_frame(&mut sender, &codec, &connection_id, code, e)
                                        .await
                                        .is_err();
                                    if failed || read_buffer.is_empty() {
                                        break;
                                    }
                                }
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    disconnect(&state, &mut session).await;
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Dispatch one decoded event and record its outcome.
///
/// Relay failures are logged and counted; the client is not told.
async fn handle_event(state: &AppState, session: &mut Session, event: ClientEvent) {
    let name = event.name();
    metrics::record_event(name);
    let start = Instant::now();

    match state.relay.dispatch(session, event).await {
        Ok(Outcome::Registered) => metrics::set_presence(state.relay.stats()),
        Ok(Outcome::Message(delivery)) => metrics::record_delivery(name, delivery.as_str()),
        Ok(Outcome::Typing(delivery)) => metrics::record_delivery(name, delivery.as_str()),
        Err(RelayError::InvalidUsername(reason)) => {
            warn!(connection = %session.id(), reason, "Ignoring register");
            metrics::record_error("invalid_username");
        }
        Err(e) => {
            error!(connection = %session.id(), event = name, error = %e, "Event handling failed");
            metrics::record_error("relay");
        }
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}

async fn disconnect(state: &AppState, session: &mut Session) {
    if let Err(e) = state.relay.disconnect(session).await {
        error!(connection = %session.id(), error = %e, "Disconnect cleanup failed");
        metrics::record_error("relay");
    }
    metrics::set_presence(state.relay.stats());
}

/// Tell the client a frame was rejected.
async fn reject_frame(
    sender: &mut WsSender,
    codec: &EventCodec,
    connection_id: &ConnectionId,
    code: u16,
    error: ProtocolError,
) -> Result<()> {
    warn!(connection = %connection_id, error = %error, "Undecodable frame");
    metrics::record_error("decode");
    send_event(sender, codec, &ServerEvent::error(code, error.to_string())).await
}

/// Encode an event in the connection's encoding and write it.
async fn send_event(sender: &mut WsSender, codec: &EventCodec, event: &ServerEvent) -> Result<()> {
    let frame = codec.encode(event)?;
    metrics::record_frame(frame.len(), "outbound");

    let message = match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}
