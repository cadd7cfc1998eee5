//! Signal relay
//!
//! One task per connection reads inbound frames sequentially; a writer task
//! owns the sink and drains the bounded outbound queue, so a slow receiver
//! never stalls a sender's read loop. Inbound envelopes are decoded, gated
//! on authentication, and routed: presence to the notifier, call signaling
//! to the session manager, conversation hints forwarded verbatim. A
//! malformed frame is dropped; it never closes an otherwise healthy session.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chatwire_shared::Envelope;

use crate::calls::{CallSessionManager, SessionError};
use crate::config::ServerConfig;
use crate::presence::PresenceNotifier;
use crate::registry::{Connection, ConnectionRegistry, OUTBOUND_QUEUE};
use crate::store::UserStore;

/// Burst budget of the per-connection rate limiter.
const RATE_BURST: f64 = 30.0;
/// Sustained envelope rate per second.
const RATE_REFILL_PER_SEC: f64 = 10.0;

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Simple token-bucket rate limiter (one per connection, never shared)
struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Returns false if rate limit exceeded.
    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection state
// ---------------------------------------------------------------------------

/// State the relay keeps for one connection: the registry handle, the
/// authenticated binding (`None` until an `authenticate` envelope arrives),
/// and the rate limiter.
pub struct ClientConn {
    conn: Connection,
    user_id: Option<i64>,
    limiter: RateLimiter,
}

impl ClientConn {
    /// Wrap a fresh connection in the unauthenticated state.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            user_id: None,
            limiter: RateLimiter::new(RATE_BURST, RATE_REFILL_PER_SEC),
        }
    }

    /// The registry handle of this connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// The authenticated user, if any.
    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by all connection tasks, owned by the composition root.
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// User store collaborator
    pub store: Arc<UserStore>,
    /// Live connections
    pub registry: Arc<ConnectionRegistry>,
    /// Presence fan-out
    pub presence: PresenceNotifier,
    /// Call session state machines
    pub calls: CallSessionManager,
    /// Current total connection count (for enforcing max_connections)
    connection_count: AtomicUsize,
    /// Per-IP connection counts (for enforcing max_connections_per_ip)
    ip_connections: DashMap<IpAddr, AtomicUsize>,
}

impl AppState {
    /// Wire up the shared state from its two external inputs.
    pub fn new(config: ServerConfig, store: UserStore) -> Self {
        let store = Arc::new(store);
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceNotifier::new(registry.clone(), store.clone());
        let calls = CallSessionManager::new(registry.clone());
        Self {
            config,
            store,
            registry,
            presence,
            calls,
            connection_count: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        }
    }

    /// Relay a read receipt produced by the REST layer's side effect.
    /// Returns whether the recipient was online to receive it.
    pub fn notify_messages_read(&self, recipient: i64, conversation_id: i64, read_by: i64) -> bool {
        self.registry.send(
            recipient,
            &Envelope::MessagesRead {
                conversation_id,
                read_by,
            },
        )
    }

    /// Try to acquire a connection slot. Returns false if limits are exceeded.
    fn try_acquire_connection(&self, ip: IpAddr) -> bool {
        let max_global = self.config.max_connections;
        let max_per_ip = self.config.max_connections_per_ip;

        // Check global limit (0 = unlimited)
        if max_global > 0 && self.connection_count.load(Ordering::Relaxed) >= max_global {
            return false;
        }

        // Check per-IP limit (0 = unlimited)
        if max_per_ip > 0 {
            let entry = self
                .ip_connections
                .entry(ip)
                .or_insert_with(|| AtomicUsize::new(0));
            if entry.value().load(Ordering::Relaxed) >= max_per_ip {
                return false;
            }
            entry.value().fetch_add(1, Ordering::Relaxed);
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a connection slot.
    fn release_connection(&self, ip: IpAddr) {
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(entry) = self.ip_connections.get(&ip) {
            let prev = entry.value().fetch_sub(1, Ordering::Relaxed);
            if prev <= 1 {
                drop(entry);
                self.ip_connections.remove(&ip);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket upgrade handler
// ---------------------------------------------------------------------------

/// Handle WebSocket upgrade — enforces connection limits before accepting
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip();

    if !state.try_acquire_connection(ip) {
        warn!("connection rejected for {}: limit exceeded", ip);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let ip = addr.ip();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let mut client = ClientConn::new(Connection::new(tx));
    info!("new WebSocket connection {} from {}", client.conn.id(), addr);

    // Writer task: owns the sink, drains the outbound queue, keeps the
    // connection alive with periodic pings.
    let writer = tokio::spawn(write_loop(ws_sender, rx, state.config.ws_ping_interval));

    // A connection that never authenticates is dropped after the deadline;
    // a pre-auth envelope by itself never closes the connection.
    let auth_deadline = tokio::time::Instant::now()
        + Duration::from_secs(state.config.auth_timeout_seconds);

    loop {
        let next = if client.user_id.is_none() {
            match tokio::time::timeout_at(auth_deadline, ws_receiver.next()).await {
                Ok(msg) => msg,
                Err(_) => {
                    warn!(
                        "connection {} from {} dropped: not authenticated within deadline",
                        client.conn.id(),
                        addr
                    );
                    break;
                }
            }
        } else {
            ws_receiver.next().await
        };

        match next {
            Some(Ok(Message::Text(frame))) => {
                handle_frame(&state, &mut client, &frame).await;
            }
            Some(Ok(Message::Binary(_))) => {
                debug!("ignoring binary frame on connection {}", client.conn.id());
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // axum answers pings itself; pongs need no bookkeeping
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(
                    "connection {} closed by client: {:?}",
                    client.conn.id(),
                    frame
                );
                break;
            }
            Some(Err(e)) => {
                debug!("WebSocket error on connection {}: {}", client.conn.id(), e);
                break;
            }
            None => break,
        }
    }

    disconnect(&state, &client).await;
    state.release_connection(ip);
    writer.abort();
}

/// Writer task: forwards queued messages to the sink and sends a ping every
/// `ping_interval` seconds.
async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    ping_interval: u64,
) {
    let mut ping = tokio::time::interval(Duration::from_secs(ping_interval));
    ping.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if sink.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame dispatch
// ---------------------------------------------------------------------------

/// Decode and route one inbound text frame.
///
/// Decode failures, pre-auth envelopes, unknown types, and call state
/// machine violations are all logged and dropped; none of them close the
/// connection.
pub async fn handle_frame(state: &AppState, client: &mut ClientConn, frame: &str) {
    let envelope = match Envelope::decode(frame, state.config.max_frame_size) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("discarding frame on connection {}: {}", client.conn.id(), e);
            return;
        }
    };
    let kind = envelope.kind();

    if let Envelope::Authenticate { user_id } = envelope {
        authenticate(state, client, user_id).await;
        return;
    }

    let Some(user) = client.user_id else {
        warn!(
            "dropping {} from unauthenticated connection {}",
            kind,
            client.conn.id()
        );
        return;
    };

    // ICE trickle is bursty, so the WebRTC hot path is exempt; everything
    // else is metered.
    if !matches!(envelope, Envelope::WebRtcSignal { .. }) && !client.limiter.try_consume() {
        warn!("rate limit exceeded for user {} — dropping {}", user, kind);
        return;
    }

    match envelope {
        // Same-time conversation hints: forwarded verbatim, best-effort.
        // The REST response is authoritative for the underlying state.
        Envelope::Typing { receiver_id, .. }
        | Envelope::TypingStop { receiver_id, .. }
        | Envelope::AddReaction { receiver_id, .. }
        | Envelope::ReactionRemoved { receiver_id, .. }
        | Envelope::EditMessage { receiver_id, .. }
        | Envelope::DeleteMessage { receiver_id, .. } => {
            if !state.registry.send_raw(receiver_id, frame.to_owned()) {
                debug!("dropped {} hint for offline user {}", kind, receiver_id);
            }
        }

        Envelope::CallRequest {
            contact_id,
            media_type,
            session_id,
            ..
        } => {
            // `from` is the authenticated binding, never the client payload
            log_violation(
                user,
                state
                    .calls
                    .handle_request(user, contact_id, media_type, session_id),
            );
        }
        Envelope::CallAccepted { session_id, .. } => {
            log_violation(user, state.calls.handle_accept(user, &session_id));
        }
        Envelope::CallRejected {
            session_id, reason, ..
        } => {
            log_violation(user, state.calls.handle_reject(user, &session_id, reason));
        }
        Envelope::CallEnded { session_id, .. } => {
            log_violation(user, state.calls.handle_end(user, &session_id));
        }
        Envelope::WebRtcSignal { payload } => {
            log_violation(
                user,
                state.calls.handle_signal(user, &payload, frame.to_owned()),
            );
        }

        Envelope::StatusUpdate { .. } | Envelope::MessagesRead { .. } => {
            warn!("user {} sent server-only envelope {} — dropped", user, kind);
        }
        Envelope::Unknown => {
            warn!(
                "user {} sent unrecognized envelope type — dropped, connection stays open",
                user
            );
        }
        Envelope::Authenticate { .. } => {} // handled above
    }
}

/// Bind the connection to `user_id` and run the online presence path.
async fn authenticate(state: &AppState, client: &mut ClientConn, user_id: i64) {
    if let Some(bound) = client.user_id {
        if bound != user_id {
            // The connection is switching identity; release the old binding
            // with full disconnect semantics first.
            if state.registry.unregister(bound, client.conn.id()) {
                state.calls.connection_closed(bound);
                state.presence.user_offline(bound).await;
            }
        }
    }

    client.user_id = Some(user_id);
    if let Some(evicted) = state.registry.register(user_id, client.conn.clone()) {
        if evicted.id() != client.conn.id() {
            info!(
                "user {} reconnected — closing stale connection {}",
                user_id,
                evicted.id()
            );
            evicted.close("replaced by newer connection");
        }
    }

    // Deliberately idempotent: re-authenticating after a reconnect replays
    // the online notification to contacts.
    state.presence.user_online(user_id).await;
    info!("user {} authenticated on connection {}", user_id, client.conn.id());
}

/// Tear down a closing connection: registry removal happens-before session
/// teardown and the offline presence fan-out, and the latter two run only
/// when this connection still owned the registry entry (a stale disconnect
/// racing a newer registration must leave the new connection untouched).
pub async fn disconnect(state: &AppState, client: &ClientConn) {
    let Some(user_id) = client.user_id else {
        return;
    };

    if state.registry.unregister(user_id, client.conn.id()) {
        state.calls.connection_closed(user_id);
        state.presence.user_offline(user_id).await;
        info!("user {} disconnected", user_id);
    } else {
        debug!(
            "stale disconnect for user {} (connection {}) — registry untouched",
            user_id,
            client.conn.id()
        );
    }
}

fn log_violation(user: i64, result: Result<(), SessionError>) {
    if let Err(e) = result {
        warn!("call signaling violation from user {}: {}", user, e);
    }
}
