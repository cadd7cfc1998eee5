//! Connection registry
//!
//! Maps a user id to its single live WebSocket connection. The registry owns
//! nothing but the outbound queue handle; the transport layer owns the
//! socket and reports its closure. At most one entry exists per user id at
//! any instant: registering a second connection evicts the first.

use axum::extract::ws::{CloseFrame, Message};
use chatwire_shared::Envelope;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound queue depth per connection. A receiver that falls this far
/// behind starts losing events (delivery is at-most-once).
pub const OUTBOUND_QUEUE: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live connection's outbound queue.
///
/// The instance id distinguishes successive connections of the same user so
/// a stale disconnect event cannot unregister a newer registration.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    tx: mpsc::Sender<Message>,
}

impl Connection {
    /// Wrap an outbound queue sender, assigning a fresh instance id.
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Process-wide instance id of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a close frame; the writer task delivers it and the transport
    /// tears the socket down.
    pub fn close(&self, reason: &str) {
        let frame = CloseFrame {
            code: 4000,
            reason: reason.to_owned().into(),
        };
        let _ = self.tx.try_send(Message::Close(Some(frame)));
    }

    fn push(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

/// user id -> Connection
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: DashMap<i64, Connection>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    /// Bind `user_id` to `conn`, returning the previous connection (if any)
    /// so the caller can close the orphaned socket.
    pub fn register(&self, user_id: i64, conn: Connection) -> Option<Connection> {
        self.conns.insert(user_id, conn)
    }

    /// Remove the entry for `user_id` only if it still refers to the
    /// connection instance being torn down. Returns whether an entry was
    /// removed; `false` means a newer connection already took the slot.
    pub fn unregister(&self, user_id: i64, connection_id: u64) -> bool {
        self.conns
            .remove_if(&user_id, |_, c| c.id == connection_id)
            .is_some()
    }

    /// Look up the live connection for `user_id`. Never blocks.
    pub fn get(&self, user_id: i64) -> Option<Connection> {
        self.conns.get(&user_id).map(|e| e.value().clone())
    }

    /// Whether `user_id` currently has a live connection.
    pub fn is_online(&self, user_id: i64) -> bool {
        self.conns.contains_key(&user_id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Serialize `envelope` and queue it for `user_id`. Returns whether the
    /// write was handed to a live connection's queue. No retry, no queuing
    /// beyond the per-connection channel: an offline receiver simply does
    /// not get the event.
    pub fn send(&self, user_id: i64, envelope: &Envelope) -> bool {
        let frame = match envelope.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!("dropping outbound {} envelope: {}", envelope.kind(), e);
                return false;
            }
        };
        self.send_raw(user_id, frame)
    }

    /// Queue an already-serialized frame for `user_id` verbatim.
    pub fn send_raw(&self, user_id: i64, frame: String) -> bool {
        match self.conns.get(&user_id) {
            Some(entry) => {
                let queued = entry.value().push(Message::Text(frame));
                if !queued {
                    debug!("outbound queue unavailable for user {}", user_id);
                }
                queued
            }
            None => false,
        }
    }
}
