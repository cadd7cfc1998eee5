//! Typed real-time envelopes
//!
//! Every frame on the wire is a single JSON object with a `type`
//! discriminator. Call control types use kebab-case tags, everything else
//! snake_case; field names are camelCase. These shapes are shared verbatim
//! with the web and mobile clients, so renames here are wire changes.

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio-only call
    Audio,
    /// Video-only call
    Video,
    /// Audio and video
    Both,
}

/// Discriminator of a WebRTC negotiation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// SDP offer
    #[serde(rename = "offer")]
    Offer,
    /// SDP answer
    #[serde(rename = "answer")]
    Answer,
    /// Trickled ICE candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate,
}

/// Inner payload of a `webrtc-signal` envelope.
///
/// `payload` holds the SDP or ICE structure produced by the sender's WebRTC
/// stack. The server validates only the addressing fields and forwards the
/// payload untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcPayload {
    /// Which negotiation step this is
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Sending user id
    pub from: i64,
    /// Addressed user id
    pub to: i64,
    /// Call session this signal belongs to
    pub session_id: String,
    /// Opaque SDP/ICE structure, relayed verbatim
    pub payload: serde_json::Value,
}

/// A single typed real-time message.
///
/// `status_update` and `messages_read` are server-to-client only; a client
/// sending them is a protocol violation. Unrecognized `type` tags decode to
/// [`Envelope::Unknown`] so one unexpected frame never kills a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Binds the connection to a user id established by the out-of-band
    /// auth handshake. First envelope a client must send.
    #[serde(rename = "authenticate", rename_all = "camelCase")]
    Authenticate {
        /// Authenticated user id
        user_id: i64,
    },

    /// Typing indicator, relayed to the other conversation participant.
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        /// Conversation the indicator belongs to
        conversation_id: i64,
        /// Other participant
        receiver_id: i64,
    },

    /// End of a typing indicator.
    #[serde(rename = "typing_stop", rename_all = "camelCase")]
    TypingStop {
        /// Conversation the indicator belongs to
        conversation_id: i64,
        /// Other participant
        receiver_id: i64,
    },

    /// Starts a call attempt toward `contact_id`.
    #[serde(rename = "call-request", rename_all = "camelCase")]
    CallRequest {
        /// Callee user id
        contact_id: i64,
        /// Requested media
        media_type: MediaKind,
        /// Caller-generated session id, unique per attempt
        session_id: String,
        /// Caller user id, injected by the server when forwarding; never
        /// trusted from the client
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<i64>,
    },

    /// Callee accepted the call.
    #[serde(rename = "call-accepted", rename_all = "camelCase")]
    CallAccepted {
        /// The other party of the call
        contact_id: i64,
        /// Session being accepted
        session_id: String,
        /// Server-injected sender id on forward
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<i64>,
    },

    /// Callee declined, or the server rejected the attempt.
    #[serde(rename = "call-rejected", rename_all = "camelCase")]
    CallRejected {
        /// The other party of the call
        contact_id: i64,
        /// Session being rejected
        session_id: String,
        /// Human-readable cause, e.g. "user offline"
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Server-injected sender id on forward
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<i64>,
    },

    /// Either party hung up, or the server tore the session down.
    #[serde(rename = "call-ended", rename_all = "camelCase")]
    CallEnded {
        /// The other party of the call
        contact_id: i64,
        /// Session being ended
        session_id: String,
        /// Cause when server-synthesized, e.g. "peer disconnected"
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Server-injected sender id on forward
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<i64>,
    },

    /// WebRTC negotiation message wrapped for relay.
    #[serde(rename = "webrtc-signal")]
    WebRtcSignal {
        /// Addressed negotiation payload
        payload: WebRtcPayload,
    },

    /// Same-time hint that a reaction was added. The REST response is
    /// authoritative; the relay does not validate message state.
    #[serde(rename = "add_reaction", rename_all = "camelCase")]
    AddReaction {
        /// Message the reaction applies to
        message_id: i64,
        /// Conversation of the message
        conversation_id: i64,
        /// Other participant
        receiver_id: i64,
        /// Reaction emoji
        emoji: String,
    },

    /// Hint that a reaction was removed.
    #[serde(rename = "message_reaction_removed", rename_all = "camelCase")]
    ReactionRemoved {
        /// Message the reaction applied to
        message_id: i64,
        /// Conversation of the message
        conversation_id: i64,
        /// Other participant
        receiver_id: i64,
    },

    /// Hint that a message was edited.
    #[serde(rename = "edit_message", rename_all = "camelCase")]
    EditMessage {
        /// Edited message
        message_id: i64,
        /// Conversation of the message
        conversation_id: i64,
        /// Other participant
        receiver_id: i64,
    },

    /// Hint that a message was deleted.
    #[serde(rename = "delete_message", rename_all = "camelCase")]
    DeleteMessage {
        /// Deleted message
        message_id: i64,
        /// Conversation of the message
        conversation_id: i64,
        /// Other participant
        receiver_id: i64,
    },

    /// A contact's presence changed. Server to client only.
    #[serde(rename = "status_update", rename_all = "camelCase")]
    StatusUpdate {
        /// User whose presence changed
        user_id: i64,
        /// New presence
        is_online: bool,
    },

    /// Read receipts flushed by the REST layer. Server to client only.
    #[serde(rename = "messages_read", rename_all = "camelCase")]
    MessagesRead {
        /// Conversation that was read
        conversation_id: i64,
        /// User who read it
        read_by: i64,
    },

    /// Catch-all for unrecognized `type` tags; dropped by the relay.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Decode one text frame, enforcing a size cap before parsing.
    pub fn decode(frame: &str, max_len: usize) -> Result<Self, EnvelopeError> {
        if frame.len() > max_len {
            return Err(EnvelopeError::Oversized {
                len: frame.len(),
                limit: max_len,
            });
        }
        Ok(serde_json::from_str(frame)?)
    }

    /// Serialize to the single-object text frame form.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Authenticate { .. } => "authenticate",
            Envelope::Typing { .. } => "typing",
            Envelope::TypingStop { .. } => "typing_stop",
            Envelope::CallRequest { .. } => "call-request",
            Envelope::CallAccepted { .. } => "call-accepted",
            Envelope::CallRejected { .. } => "call-rejected",
            Envelope::CallEnded { .. } => "call-ended",
            Envelope::WebRtcSignal { .. } => "webrtc-signal",
            Envelope::AddReaction { .. } => "add_reaction",
            Envelope::ReactionRemoved { .. } => "message_reaction_removed",
            Envelope::EditMessage { .. } => "edit_message",
            Envelope::DeleteMessage { .. } => "delete_message",
            Envelope::StatusUpdate { .. } => "status_update",
            Envelope::MessagesRead { .. } => "messages_read",
            Envelope::Unknown => "unknown",
        }
    }
}
