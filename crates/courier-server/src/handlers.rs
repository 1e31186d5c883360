//! Connection handlers for the Courier server.
//!
//! Each WebSocket connection runs one task that drains its outbound mailbox
//! and processes inbound events in arrival order. Store-backed operations
//! are awaited inline, so one connection's persistence wait never stalls
//! another connection; it only defers that connection's next event.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::{
    CallRelay, ChatStore, FanoutEngine, FanoutError, MemoryStore, OutgoingMessage,
    PresencePublisher, RoomConfig, RoomError, RoomTracker, SessionRegistry, TypingTracker,
};
use courier_protocol::{codec, error_code, ClientEvent, PresenceStatus, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state: the coordination components wired together.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub rooms: Arc<RoomTracker>,
    pub typing: TypingTracker,
    pub presence: PresencePublisher,
    pub fanout: FanoutEngine,
    pub calls: CallRelay,
    pub config: Config,
}

impl AppState {
    /// Wire up the components over the given store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn ChatStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let rooms = Arc::new(RoomTracker::with_config(
            Arc::clone(&registry),
            RoomConfig {
                max_rooms_per_connection: config.limits.max_rooms_per_connection,
            },
        ));

        Self {
            typing: TypingTracker::new(Arc::clone(&rooms)),
            presence: PresencePublisher::new(Arc::clone(&registry)),
            fanout: FanoutEngine::new(store, Arc::clone(&rooms), Arc::clone(&registry)),
            calls: CallRelay::new(Arc::clone(&registry)),
            registry,
            rooms,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // The production document store is an external collaborator; the
    // default binary runs against the in-process store.
    let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
    let state = Arc::new(AppState::new(config.clone(), store));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler with liveness counters.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": sessions.connection_count,
        "online_users": sessions.online_users,
        "rooms": state.rooms.room_count(),
        "calls": state.calls.active_calls(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle one WebSocket connection from admission to cleanup.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!(
        "conn_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    );

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // The outbound mailbox: everything addressed to this connection by any
    // component lands here and is drained into the socket below.
    let (tx, mut outbox) = mpsc::unbounded_channel::<ServerEvent>();
    state.registry.connect(connection_id.clone(), tx);

    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(event) = outbox.recv() => {
                match codec::encode(&event) {
                    Ok(data) => {
                        metrics::record_message(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Outbound encode failed");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            let buffered = read_buffer.len();
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    // Bytes consumed by this frame, not the
                                    // whole payload, which may coalesce frames.
                                    metrics::record_message(
                                        buffered - read_buffer.len(),
                                        "inbound",
                                    );
                                    handle_event(event, &connection_id, &state).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Undecodable frame");
                                    metrics::record_error("decode");
                                    state.registry.send_to_connection(
                                        &connection_id,
                                        ServerEvent::error(error_code::BAD_EVENT, e.to_string()),
                                    );
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_) | Message::Text(_))) => {
                        // Pongs are transport-level; text frames carry no events.
                    }
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

    cleanup_connection(&connection_id, &state);
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Dispatch one decoded client event.
async fn handle_event(event: ClientEvent, connection_id: &str, state: &Arc<AppState>) {
    match event {
        ClientEvent::UserJoin { user_id } => {
            match state.registry.register(&user_id, connection_id) {
                Ok(registration) => {
                    if let Some(displaced) = registration.displaced_offline {
                        state.presence.publish(&displaced, PresenceStatus::Offline);
                        state.calls.drop_user(&displaced);
                    }
                    if registration.came_online {
                        state.presence.publish(&user_id, PresenceStatus::Online);
                    }
                    info!(connection = %connection_id, user = %user_id, "User joined");
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "user:join failed");
                }
            }
        }

        ClientEvent::ConversationJoin { conversation_id } => {
            match state.rooms.join(&conversation_id, connection_id) {
                Ok(_) => {
                    debug!(connection = %connection_id, room = %conversation_id, "Joined conversation");
                }
                Err(e) => {
                    let code = match e {
                        RoomError::RoomLimit => error_code::ROOM_LIMIT,
                        RoomError::UnknownConnection(_) => error_code::BAD_EVENT,
                    };
                    state
                        .registry
                        .send_to_connection(connection_id, ServerEvent::error(code, e.to_string()));
                }
            }
            metrics::set_active_rooms(state.rooms.room_count());
        }

        ClientEvent::ConversationLeave { conversation_id } => {
            state.rooms.leave(&conversation_id, connection_id);
            metrics::set_active_rooms(state.rooms.room_count());
        }

        ClientEvent::MessageSend {
            conversation_id,
            content,
            kind,
            attachment,
        } => {
            let Some(user_id) = state.registry.user_of(connection_id) else {
                state.registry.send_to_connection(
                    connection_id,
                    ServerEvent::error(error_code::BAD_EVENT, "identify with user:join first"),
                );
                return;
            };

            if content.len() > state.config.limits.max_message_size {
                state.registry.send_to_connection(
                    connection_id,
                    ServerEvent::error(error_code::BAD_EVENT, "message too large"),
                );
                return;
            }

            let outgoing = OutgoingMessage {
                conversation_id,
                content,
                kind,
                attachment,
            };

            // Awaited inline: this connection's next event waits for the
            // store, other connections do not.
            match state.fanout.send(connection_id, &user_id, None, outgoing).await {
                Ok(record) => {
                    metrics::record_message(record.content.len(), "fanout");
                }
                Err(e @ FanoutError::Unauthorized(_)) => {
                    metrics::record_error("unauthorized");
                    state.registry.send_to_connection(
                        connection_id,
                        ServerEvent::error(error_code::UNAUTHORIZED, e.to_string()),
                    );
                }
                Err(e @ FanoutError::Persistence(_)) => {
                    error!(connection = %connection_id, error = %e, "Message persistence failed");
                    metrics::record_error("persistence");
                    state.registry.send_to_connection(
                        connection_id,
                        ServerEvent::error(error_code::PERSISTENCE, "failed to send message"),
                    );
                }
            }
        }

        ClientEvent::TypingStart {
            conversation_id,
            user_id,
            username,
        } => {
            state
                .typing
                .set_typing(&conversation_id, &user_id, username, true, connection_id);
        }

        ClientEvent::TypingStop {
            conversation_id,
            user_id,
        } => {
            state
                .typing
                .set_typing(&conversation_id, &user_id, None, false, connection_id);
        }

        ClientEvent::CallStart { to, offer, has_video } => {
            let Some(from) = identified(state, connection_id) else { return };
            if let Err(e) = state.calls.start(&from, &to, offer, has_video) {
                debug!(connection = %connection_id, error = %e, "call:start refused");
            }
            metrics::set_active_calls(state.calls.active_calls());
        }

        ClientEvent::CallAnswer { to, answer } => {
            let Some(from) = identified(state, connection_id) else { return };
            if let Err(e) = state.calls.answer(&from, &to, answer) {
                // Client-side race (e.g. answer after cancel); nothing to relay.
                debug!(connection = %connection_id, error = %e, "call:answer ignored");
            }
        }

        ClientEvent::CallIceCandidate { to, candidate } => {
            let Some(from) = identified(state, connection_id) else { return };
            if let Err(e) = state.calls.ice_candidate(&from, &to, candidate) {
                debug!(connection = %connection_id, error = %e, "call:ice-candidate dropped");
            }
        }

        ClientEvent::CallReject { to } => {
            let Some(from) = identified(state, connection_id) else { return };
            if let Err(e) = state.calls.reject(&from, &to) {
                debug!(connection = %connection_id, error = %e, "call:reject ignored");
            }
            metrics::set_active_calls(state.calls.active_calls());
        }

        ClientEvent::CallEnd { to } => {
            let Some(from) = identified(state, connection_id) else { return };
            if let Err(e) = state.calls.end(&from, &to) {
                debug!(connection = %connection_id, error = %e, "call:end ignored");
            }
            metrics::set_active_calls(state.calls.active_calls());
        }
    }
}

/// The user a connection is bound to, or an error event if it never
/// identified itself.
fn identified(state: &AppState, connection_id: &str) -> Option<String> {
    let user = state.registry.user_of(connection_id);
    if user.is_none() {
        state.registry.send_to_connection(
            connection_id,
            ServerEvent::error(error_code::BAD_EVENT, "identify with user:join first"),
        );
    }
    user
}

/// Tear down a connection's footprint: typing state, rooms, registry entry,
/// presence, and any call sessions once the user is fully offline.
fn cleanup_connection(connection_id: &str, state: &Arc<AppState>) {
    if let Some(user_id) = state.registry.user_of(connection_id) {
        state.typing.clear_user(&user_id, Some(connection_id));
    }

    state.rooms.leave_all(connection_id);

    if let Some(gone) = state.registry.disconnect(connection_id) {
        if gone.went_offline {
            if let Some(user_id) = gone.user_id {
                state.presence.publish(&user_id, PresenceStatus::Offline);
                state.calls.drop_user(&user_id);
            }
        }
    }

    metrics::set_active_rooms(state.rooms.room_count());
    metrics::set_active_calls(state.calls.active_calls());
}
