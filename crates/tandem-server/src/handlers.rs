//! Connection handlers for the Tandem server.
//!
//! This module owns the HTTP router and the live-connection lifecycle: token
//! check before upgrade, the `connected` handshake, then a loop that writes
//! outbox frames and dispatches inbound frames until either side goes away.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tandem_core::{
    ChatHub, ConversationStore, JwtVerifier, LiveSession, MemoryStore, SqliteStore,
    UserDirectory,
};
use tandem_protocol::{codec, codes, Encoding, Frame, FrameType};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Chat core.
    pub hub: Arc<ChatHub>,
    /// Server configuration.
    pub config: Config,
    /// Encoding for clients that do not pick one.
    pub default_encoding: Encoding,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured default encoding is unknown.
    pub fn new(config: Config, hub: Arc<ChatHub>) -> Result<Self> {
        let default_encoding = config.encoding()?;
        Ok(Self {
            hub,
            config,
            default_encoding,
        })
    }
}

/// Open the configured store.
async fn open_store(
    config: &Config,
) -> Result<(Arc<dyn ConversationStore>, Arc<dyn UserDirectory>)> {
    let url = config.store.url.trim();
    if url == "memory" {
        warn!("Using in-memory store; history is lost on restart");
        let store = Arc::new(MemoryStore::new());
        return Ok((store.clone(), store));
    }

    let store = Arc::new(
        SqliteStore::connect(url, config.store.max_connections)
            .await
            .with_context(|| format!("Failed to open store at {url}"))?,
    );
    info!(url = %url, "Opened SQLite store");
    Ok((store.clone(), store))
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let (store, directory) = open_store(&config).await?;
    let verifier = Arc::new(JwtVerifier::new(
        config.auth.jwt_secret.as_bytes(),
        config.auth.leeway_secs,
    ));
    let hub = Arc::new(ChatHub::new(verifier, store, directory, config.hub_config()));
    let state = Arc::new(AppState::new(config.clone(), hub)?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => {
                metrics::spawn_gauge_refresh(state.hub.clone(), metrics::GAUGE_REFRESH_INTERVAL);
            }
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }

    let app = build_app(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Tandem server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the full router: chat API, live channel and health check.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors.allowed_origins);
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.registry.connection_count,
        "users": stats.registry.user_count,
        "rooms": stats.registry.room_count,
        "subscriptions": stats.registry.total_subscriptions,
    }))
}

/// Live-channel query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Access token, for clients that cannot set headers.
    pub token: Option<String>,
    /// `msgpack` or `json`.
    pub encoding: Option<String>,
}

fn reject(status: StatusCode, reason: &'static str, message: &str) -> Response {
    metrics::record_rejected(reason);
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// WebSocket upgrade handler.
///
/// The token is verified before the upgrade; a bad or missing token never
/// reaches the socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = params
        .token
        .as_deref()
        .or_else(|| api::bearer_token(&headers));
    let Some(token) = token else {
        return reject(StatusCode::UNAUTHORIZED, "missing_token", "Unauthenticated");
    };
    let Ok(user) = state.hub.authenticate(token) else {
        return reject(StatusCode::UNAUTHORIZED, "invalid_token", "Unauthenticated");
    };

    let encoding = match params.encoding.as_deref() {
        None => state.default_encoding,
        Some(name) => match Encoding::parse(name) {
            Some(encoding) => encoding,
            None => {
                return reject(StatusCode::BAD_REQUEST, "bad_encoding", "Unknown encoding");
            }
        },
    };

    let (session, outbox) = match state.hub.open(user) {
        Ok(opened) => opened,
        Err(e) => {
            warn!(error = %e, "Admission refused");
            return reject(StatusCode::SERVICE_UNAVAILABLE, "capacity", "Server at capacity");
        }
    };

    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, session, outbox, encoding))
}

/// Handle an admitted WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    session: LiveSession,
    mut outbox: mpsc::Receiver<Arc<Frame>>,
    encoding: Encoding,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = session.id();
    metrics::set_hub_gauges(&state.hub.stats());

    debug!(connection = %connection_id, user = %session.user(), ?encoding, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    if send_frame(&mut sender, encoding, &session.connected_frame())
        .await
        .is_err()
    {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Room events queued by broadcasts
            Some(frame) = outbox.recv() => {
                if send_frame(&mut sender, encoding, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        if process_binary(&session, &mut read_buffer, &mut sender, encoding)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_frame(text.len(), "inbound");
                        match codec::decode_json(&text) {
                            Ok(frame) => {
                                if dispatch(&session, frame, &mut sender, encoding).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Malformed text frame");
                                metrics::record_error("malformed");
                                let reply = Frame::error(None, codes::MALFORMED_FRAME, e.to_string());
                                if send_frame(&mut sender, encoding, &reply).await.is_err() {
                                    break;
                                }
                            }
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

    // Releases the registry entry and any typing sessions it armed.
    drop(session);
    metrics::set_hub_gauges(&state.hub.stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Dispatch every complete binary frame in `buffer`.
///
/// Stops at the first failed socket write and returns its error; frames still
/// in the buffer are left undecoded. A malformed frame clears the buffer and
/// is answered with `MALFORMED_FRAME`.
async fn process_binary<S>(
    session: &LiveSession,
    buffer: &mut BytesMut,
    sender: &mut S,
    encoding: Encoding,
) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    loop {
        match codec::decode_from(buffer) {
            Ok(Some(frame)) => dispatch(session, frame, sender, encoding).await?,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(connection = %session.id(), error = %e, "Malformed binary frame");
                buffer.clear();
                metrics::record_error("malformed");
                let reply = Frame::error(None, codes::MALFORMED_FRAME, e.to_string());
                return send_frame(sender, encoding, &reply).await;
            }
        }
    }
}

/// Hand one inbound frame to the session and write its reply.
async fn dispatch<S>(
    session: &LiveSession,
    frame: Frame,
    sender: &mut S,
    encoding: Encoding,
) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let start = Instant::now();
    let kind = frame.frame_type();
    if kind == FrameType::Typing {
        metrics::record_typing();
    }

    let reply = session.handle(frame).await;
    if let Some(reply) = &reply {
        match reply {
            Frame::Error { code, .. } => {
                debug!(connection = %session.id(), event = %kind, code, "Request failed");
                metrics::record_error(error_label(*code));
            }
            Frame::Ack {
                message_id: Some(_),
                ..
            } => metrics::record_message_sent("live"),
            _ => {}
        }
        send_frame(sender, encoding, reply).await?;
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    Ok(())
}

fn error_label(code: u16) -> &'static str {
    match code {
        codes::MALFORMED_FRAME => "malformed",
        codes::VALIDATION => "validation",
        codes::NOT_AUTHORIZED => "not_authorized",
        codes::NOT_FOUND => "not_found",
        codes::UNAVAILABLE => "transient",
        codes::UNEXPECTED_FRAME => "unexpected_frame",
        codes::LIMIT_REACHED => "limit_reached",
        _ => "other",
    }
}

/// Send a frame to the WebSocket in the connection's encoding.
async fn send_frame<S>(sender: &mut S, encoding: Encoding, frame: &Frame) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let message = match encoding {
        Encoding::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
        Encoding::Json => Message::Text(codec::encode_json(frame)?),
    };
    let len = match &message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    };
    metrics::record_frame(len, "outbound");
    sender.send(message).await?;
    Ok(())
}
