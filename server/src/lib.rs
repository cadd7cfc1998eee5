//! Chatwire signaling server
//!
//! Relays ephemeral real-time events (presence, typing and reaction hints,
//! WebRTC call negotiation) between exactly two peers over WebSocket. All
//! relay state is in-memory and rebuilt from zero on restart: connections
//! drop and pending call sessions are lost. Persisted data (users, contacts,
//! messages) belongs to the storage collaborator and the REST layer.

pub mod calls;
pub mod config;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod routing;
pub mod store;
