//! Presence notification
//!
//! Broadcasts online/offline transitions to the affected user's contacts.
//! Fan-out is O(contacts) per transition, which is fine for the
//! single-process deployment this server targets. Everything here is
//! best-effort: a store failure is logged and never blocks connection
//! setup or teardown.

use std::sync::Arc;

use chatwire_shared::Envelope;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;
use crate::store::UserStore;

/// Pushes presence transitions to online contacts via the registry.
pub struct PresenceNotifier {
    registry: Arc<ConnectionRegistry>,
    store: Arc<UserStore>,
}

impl PresenceNotifier {
    /// Build a notifier over the shared registry and user store.
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<UserStore>) -> Self {
        Self { registry, store }
    }

    /// Mark `user_id` online and tell each currently connected contact.
    /// Re-runs harmlessly when a client re-authenticates after a reconnect;
    /// contacts just see `isOnline: true` again.
    pub async fn user_online(&self, user_id: i64) {
        if let Err(e) = self.store.set_online(user_id, true).await {
            warn!("failed to persist online flag for user {}: {}", user_id, e);
        }
        self.notify_contacts(user_id, true).await;
    }

    /// Mark `user_id` offline, stamp last-seen, then notify contacts. The
    /// caller must have removed the registry entry already, so a contact
    /// reacting to the update never resolves a live connection for
    /// `user_id`.
    pub async fn user_offline(&self, user_id: i64) {
        if let Err(e) = self.store.set_online(user_id, false).await {
            warn!("failed to persist offline flag for user {}: {}", user_id, e);
        }
        if let Err(e) = self.store.touch_last_seen(user_id).await {
            warn!("failed to stamp last-seen for user {}: {}", user_id, e);
        }
        self.notify_contacts(user_id, false).await;
    }

    async fn notify_contacts(&self, user_id: i64, is_online: bool) {
        let contacts = match self.store.get_contacts(user_id).await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!("skipping presence fan-out for user {}: {}", user_id, e);
                return;
            }
        };

        let update = Envelope::StatusUpdate {
            user_id,
            is_online,
        };
        // Serialize once, reuse the frame for every online contact.
        let frame = match update.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to encode status_update for user {}: {}", user_id, e);
                return;
            }
        };

        let mut delivered = 0usize;
        for contact in &contacts {
            if self.registry.send_raw(*contact, frame.clone()) {
                delivered += 1;
            }
        }

        debug!(
            "user {} is now {} — notified {}/{} contacts",
            user_id,
            if is_online { "online" } else { "offline" },
            delivered,
            contacts.len()
        );
    }
}
