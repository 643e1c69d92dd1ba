//! Protocol error types.

use thiserror::Error;

/// Result alias for wire-level operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while parsing or building wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer shorter than the fixed part of a structure
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum length required
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// Frame body exceeds [`crate::frame::Frame::MAX_SIZE`]
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Opcode byte is not one we know
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// JSON (de)serialization failed
    #[error("json error: {0}")]
    Json(String),

    /// Payload decoded to something other than a JSON object
    #[error("message is not a json object")]
    NotAnObject,

    /// Connection metadata header could not be decoded
    #[error("invalid connection metadata: {0}")]
    InvalidMetadata(String),

    /// Machine type string is not recognized
    #[error("unknown machine type: {0}")]
    UnknownMachineType(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
