//! Error types for envelope handling

use thiserror::Error;

/// Errors raised while decoding or encoding a wire frame
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Frame is not a valid JSON envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame exceeds the configured size cap
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    Oversized {
        /// Received frame length
        len: usize,
        /// Configured maximum
        limit: usize,
    },
}
