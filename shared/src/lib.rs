//! Chatwire Wire Protocol
//!
//! This crate defines the typed envelope exchanged over the Chatwire
//! real-time channel: one JSON object per WebSocket text frame, tagged by
//! `type`. The server relays envelopes between two peers; it never persists
//! them and never inspects the encrypted payloads they may carry.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod envelope;
pub mod error;

pub use envelope::{Envelope, MediaKind, SignalKind, WebRtcPayload};
pub use error::EnvelopeError;

/// Version of the signaling protocol
pub const PROTOCOL_VERSION: u8 = 1;
