//! Call session state machine
//!
//! Tracks one state machine per call attempt, keyed by the caller-generated
//! session id. The manager coordinates request/accept/reject/end control
//! messages and relays WebRTC negotiation envelopes between the two
//! participants; it never looks inside SDP or ICE payloads. Media flows
//! peer-to-peer once negotiated and never touches this process.
//!
//! Live sessions are `requested`, `accepted`, or `connected`. Terminal
//! outcomes (declined, ended, failed) remove the entry instead of being
//! stored, and every failure surfaces a terminal envelope to at least the
//! still-reachable party.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chatwire_shared::{Envelope, MediaKind, SignalKind, WebRtcPayload};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

/// States a live call session can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Request forwarded to the callee, ringing
    Requested,
    /// Callee accepted, negotiation in progress
    Accepted,
    /// An answer has been relayed; the peers are connecting directly
    Connected,
}

/// Server-side state for one call attempt between two users.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Caller-generated session id, unique per attempt
    pub id: String,
    /// User who sent the call-request
    pub initiator: i64,
    /// User the call is addressed to
    pub target: i64,
    /// Requested media
    pub media: MediaKind,
    /// Current state
    pub state: CallState,
    /// When the request was accepted into the table
    pub created_at: Instant,
}

impl CallSession {
    fn involves(&self, user_id: i64) -> bool {
        user_id == self.initiator || user_id == self.target
    }

    fn peer_of(&self, user_id: i64) -> i64 {
        if user_id == self.initiator {
            self.target
        } else {
            self.initiator
        }
    }
}

/// Why a call signaling message was refused. Violations are logged by the
/// relay and never close the connection.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// A call-request reused a live session id
    #[error("session {0} is already active")]
    DuplicateSession(String),

    /// No live session with that id
    #[error("no live session {0}")]
    UnknownSession(String),

    /// Sender or addressee is not part of the session
    #[error("user {user} is not a valid endpoint of session {session}")]
    NotParticipant {
        /// Offending user id
        user: i64,
        /// Session id the message named
        session: String,
    },

    /// Message is not valid in the session's current state
    #[error("message not valid in the current state of session {0}")]
    InvalidState(String),
}

/// Per-call state machines, shared by all connection tasks.
pub struct CallSessionManager {
    sessions: DashMap<String, CallSession>,
    registry: Arc<ConnectionRegistry>,
}

impl CallSessionManager {
    /// Build a manager that emits envelopes through `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
        }
    }

    /// Handle a `call-request` from `from`.
    ///
    /// An offline callee produces an immediate synthetic rejection and no
    /// session; a live session id collision is a protocol violation (ids
    /// are caller-generated and unique per attempt).
    pub fn handle_request(
        &self,
        from: i64,
        contact_id: i64,
        media: MediaKind,
        session_id: String,
    ) -> Result<(), SessionError> {
        if self.sessions.contains_key(&session_id) {
            return Err(SessionError::DuplicateSession(session_id));
        }

        if !self.registry.is_online(contact_id) {
            info!(
                "call {} from user {} rejected: user {} offline",
                session_id, from, contact_id
            );
            self.registry.send(
                from,
                &Envelope::CallRejected {
                    contact_id,
                    session_id,
                    reason: Some("user offline".to_string()),
                    from: None,
                },
            );
            return Ok(());
        }

        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => return Err(SessionError::DuplicateSession(session_id)),
            Entry::Vacant(slot) => {
                slot.insert(CallSession {
                    id: session_id.clone(),
                    initiator: from,
                    target: contact_id,
                    media,
                    state: CallState::Requested,
                    created_at: Instant::now(),
                });
            }
        }

        let forward = Envelope::CallRequest {
            contact_id,
            media_type: media,
            session_id: session_id.clone(),
            from: Some(from),
        };
        if !self.registry.send(contact_id, &forward) {
            // The callee dropped between the online check and the write.
            self.sessions.remove(&session_id);
            self.registry.send(
                from,
                &Envelope::CallRejected {
                    contact_id,
                    session_id,
                    reason: Some("user offline".to_string()),
                    from: None,
                },
            );
            return Ok(());
        }

        info!(
            "call {} ringing: user {} -> user {}",
            session_id, from, contact_id
        );
        Ok(())
    }

    /// Handle `call-accepted` from `from`. Only the callee of a `requested`
    /// session may accept; a repeated accept is ignored.
    pub fn handle_accept(&self, from: i64, session_id: &str) -> Result<(), SessionError> {
        let (initiator, target) = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
            let session = entry.value_mut();
            if from != session.target {
                return Err(SessionError::NotParticipant {
                    user: from,
                    session: session_id.to_string(),
                });
            }
            if session.state != CallState::Requested {
                debug!("ignoring repeated call-accepted for session {}", session_id);
                return Ok(());
            }
            session.state = CallState::Accepted;
            (session.initiator, session.target)
        };

        let accepted = Envelope::CallAccepted {
            contact_id: target,
            session_id: session_id.to_string(),
            from: Some(target),
        };
        if !self.registry.send(initiator, &accepted) {
            self.fail_session(session_id, from, "peer unreachable");
            return Ok(());
        }

        info!("call {} accepted by user {}", session_id, from);
        Ok(())
    }

    /// Handle `call-rejected` from `from`: valid while the session is
    /// `requested` or `accepted`; the reason is forwarded to the initiator
    /// and the session destroyed.
    pub fn handle_reject(
        &self,
        from: i64,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        if from != session.target {
            return Err(SessionError::NotParticipant {
                user: from,
                session: session_id.to_string(),
            });
        }
        if session.state == CallState::Connected {
            return Err(SessionError::InvalidState(session_id.to_string()));
        }

        self.sessions.remove(session_id);
        self.registry.send(
            session.initiator,
            &Envelope::CallRejected {
                contact_id: session.target,
                session_id: session_id.to_string(),
                reason,
                from: Some(from),
            },
        );

        info!("call {} declined by user {}", session_id, from);
        Ok(())
    }

    /// Handle `call-ended` from `from`: valid from any non-terminal state.
    /// The other participant is told best-effort and the session destroyed.
    pub fn handle_end(&self, from: i64, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        if !session.involves(from) {
            return Err(SessionError::NotParticipant {
                user: from,
                session: session_id.to_string(),
            });
        }

        self.sessions.remove(session_id);
        self.registry.send(
            session.peer_of(from),
            &Envelope::CallEnded {
                contact_id: from,
                session_id: session_id.to_string(),
                reason: None,
                from: Some(from),
            },
        );

        info!("call {} ended by user {}", session_id, from);
        Ok(())
    }

    /// Relay a WebRTC negotiation envelope after validating that the
    /// session exists and both endpoints are its two participants. The
    /// original frame is forwarded verbatim; the SDP/ICE payload is opaque.
    ///
    /// An unreachable addressee fails the session: it is destroyed and the
    /// sender receives a synthetic `call-ended`.
    pub fn handle_signal(
        &self,
        from: i64,
        signal: &WebRtcPayload,
        frame: String,
    ) -> Result<(), SessionError> {
        {
            let mut entry = self
                .sessions
                .get_mut(&signal.session_id)
                .ok_or_else(|| SessionError::UnknownSession(signal.session_id.clone()))?;
            let session = entry.value_mut();

            let endpoints_match = (signal.from == session.initiator
                && signal.to == session.target)
                || (signal.from == session.target && signal.to == session.initiator);
            if !endpoints_match || signal.from != from {
                return Err(SessionError::NotParticipant {
                    user: from,
                    session: signal.session_id.clone(),
                });
            }

            if signal.kind == SignalKind::Answer && session.state == CallState::Accepted {
                session.state = CallState::Connected;
                debug!("call {} connected", signal.session_id);
            }
        }

        if !self.registry.send_raw(signal.to, frame) {
            self.fail_session(&signal.session_id, from, "peer unreachable");
        }
        Ok(())
    }

    /// Tear down every non-terminal session `user_id` participates in.
    /// Called after the user's connection has been unregistered; the
    /// remaining participant receives exactly one synthetic `call-ended`.
    pub fn connection_closed(&self, user_id: i64) {
        let affected: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().involves(user_id))
            .map(|e| e.key().clone())
            .collect();

        for session_id in affected {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                let peer = session.peer_of(user_id);
                self.registry.send(
                    peer,
                    &Envelope::CallEnded {
                        contact_id: user_id,
                        session_id: session_id.clone(),
                        reason: Some("peer disconnected".to_string()),
                        from: None,
                    },
                );
                info!(
                    "call {} torn down: user {} disconnected",
                    session_id, user_id
                );
            }
        }
    }

    /// Expire `requested` sessions older than `ring_timeout`, telling both
    /// parties. Only runs when the operator opted into ring timeouts; the
    /// wire protocol itself never times a ringing call out.
    pub fn expire_stale_requests(&self, ring_timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| {
                e.value().state == CallState::Requested
                    && now.duration_since(e.value().created_at) >= ring_timeout
            })
            .map(|e| e.key().clone())
            .collect();

        let mut expired = 0usize;
        for session_id in stale {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                self.registry.send(
                    session.initiator,
                    &Envelope::CallRejected {
                        contact_id: session.target,
                        session_id: session_id.clone(),
                        reason: Some("ring timeout".to_string()),
                        from: None,
                    },
                );
                self.registry.send(
                    session.target,
                    &Envelope::CallEnded {
                        contact_id: session.initiator,
                        session_id,
                        reason: Some("ring timeout".to_string()),
                        from: None,
                    },
                );
                expired += 1;
            }
        }
        expired
    }

    /// Snapshot of one session, if live.
    pub fn get(&self, session_id: &str) -> Option<CallSession> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Destroy `session_id` and send the still-reachable `survivor` a
    /// terminal `call-ended` carrying `reason`.
    fn fail_session(&self, session_id: &str, survivor: i64, reason: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.registry.send(
                survivor,
                &Envelope::CallEnded {
                    contact_id: session.peer_of(survivor),
                    session_id: session_id.to_string(),
                    reason: Some(reason.to_string()),
                    from: None,
                },
            );
            info!("call {} failed: {}", session_id, reason);
        }
    }
}
