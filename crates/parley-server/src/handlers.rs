//! Connection handlers for Parley server.
//!
//! This module handles the connection lifecycle: frame decoding, dispatch
//! to the relay, and draining the connection's outbox onto the socket.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{ConnectionId, Relay, RelayError};
use parley_protocol::{codec, ClientFrame, ProtocolError, ServerFrame, WireFormat, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub relay: Relay,
    pub config: Config,
    /// One permit per allowed connection, taken before the upgrade.
    connection_slots: Arc<Semaphore>,
}

impl AppState {
    /// Create new app state backed by the seeded in-memory services.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured message key is invalid.
    pub fn new(config: Config) -> Result<Self> {
        let cipher = config.cipher()?;
        let (exchanges, users, store) = config.seed.services();
        let relay = Relay::new(exchanges, users, store, cipher, config.relay_config());
        let connection_slots = Arc::new(Semaphore::new(
            config.limits.max_connections.min(Semaphore::MAX_PERMITS),
        ));

        Ok(Self {
            relay,
            config,
            connection_slots,
        })
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.relay.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "rooms": stats.room_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Ok(slot) = state.connection_slots.clone().try_acquire_owned() else {
        let limit = state.config.limits.max_connections;
        warn!(limit, "Connection limit reached, refusing upgrade");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
        .into_response()
}

/// Handle a WebSocket connection.
///
/// `_slot` is held until the connection is torn down.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: OwnedSemaphorePermit) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (outbox, mut outbound) = mpsc::unbounded_channel();
    let connection_id = state.relay.connect(outbox);
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies follow whichever encoding the client used last.
    let mut format = WireFormat::default();

    let connected = ServerFrame::connected(
        connection_id.as_str(),
        PROTOCOL_VERSION,
        u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
    );
    if send_frame(&mut sender, &connected, format).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        state.relay.disconnect(&connection_id).await;
        return;
    }

    let mut read_buffer = BytesMut::with_capacity(4096);

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            Some(frame) = outbound.recv() => {
                if send_frame(&mut sender, &frame, format).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);

                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        format = WireFormat::MessagePack;
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientFrame>(&mut read_buffer) {
                                Ok(Some(frame)) => process(&state, &connection_id, frame).await,
                                Ok(None) => break,
                                Err(e) => {
                                    reject(&state, &connection_id, &e);
                                    if matches!(e, ProtocolError::FrameTooLarge(_)) {
                                        read_buffer.clear();
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        format = WireFormat::Json;
                        metrics::record_frame(text.len(), "inbound");

                        match codec::decode_json::<ClientFrame>(&text) {
                            Ok(frame) => process(&state, &connection_id, frame).await,
                            Err(e) => reject(&state, &connection_id, &e),
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

            () = &mut idle => {
                debug!(connection = %connection_id, "Heartbeat timeout");
                break;
            }
        }
    }

    state.relay.disconnect(&connection_id).await;
    metrics::set_active_rooms(state.relay.stats().room_count);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Run one client command through the relay.
async fn process(state: &AppState, connection_id: &ConnectionId, frame: ClientFrame) {
    let command = frame.name();
    let changes_rooms = matches!(
        frame,
        ClientFrame::JoinExchange { .. }
            | ClientFrame::LeaveExchange { .. }
            | ClientFrame::Authenticate { .. }
    );

    metrics::record_command(command);
    let start = std::time::Instant::now();

    if let Err(e) = state.relay.handle_frame(connection_id, frame).await {
        metrics::record_error(e.kind());
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    if changes_rooms {
        metrics::set_active_rooms(state.relay.stats().room_count);
    }
}

/// Answer an undecodable frame with a validation error.
fn reject(state: &AppState, connection_id: &ConnectionId, e: &ProtocolError) {
    warn!(connection = %connection_id, error = %e, "Malformed frame");
    metrics::record_error("decode");

    let err = RelayError::Validation(format!("malformed frame: {e}"));
    state.relay.registry().send(connection_id, err.to_frame());
}

/// Send a frame to the WebSocket in the connection's current format.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
    format: WireFormat,
) -> Result<()> {
    let message = match format {
        WireFormat::Json => Message::Text(codec::encode_json(frame)?),
        WireFormat::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };

    metrics::record_frame(len, "outbound");
    sender.send(message).await?;
    Ok(())
}
