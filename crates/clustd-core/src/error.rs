//! Error types for the clustd core.
//!
//! One enum per concern:
//! - [`ChannelError`]: crypto framing and handshake ordering on one channel
//! - [`HandshakeError`]: why a handshake attempt did not complete
//! - [`RequestError`]: why an RPC did not get an answer
//! - [`MachineError`]: connection scheduling outcomes

use clustd_proto::ProtocolError;
use thiserror::Error;

/// Errors from a single secure channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Payload send attempted before the handshake completed
    #[error("connection not initialized")]
    NotInitialized,

    /// Socket is not open
    #[error("connection closed")]
    Closed,

    /// Envelope did not authenticate (or was not an envelope at all)
    #[error("message decryption failure, verify the cluster secret")]
    Decryption,

    /// Plaintext could not be sealed
    #[error("message encryption failure")]
    Encryption,

    /// A direction counter would wrap
    #[error("message counter exhausted")]
    CounterExhausted,

    /// Peer broke handshake ordering
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Authenticated plaintext was not a control message
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),
}

impl ChannelError {
    /// Fatal errors close the socket; the channel cannot be trusted anymore.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Decryption | Self::CounterExhausted | Self::ProtocolViolation(_))
    }
}

/// Why a handshake failed.
///
/// Only [`HandshakeError::Rejected`] stops automatic reconnection; the caller
/// has to restart the machine to try that peer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HandshakeError {
    /// No verdict in time, socket lost mid-handshake, or handshake timeout
    #[error("GENERIC_FAILURE")]
    GenericFailure,

    /// Peer identity was explicitly declined
    #[error("REJECTED")]
    Rejected,
}

impl HandshakeError {
    /// True when the scheduler must not retry on its own.
    pub fn suppresses_reconnect(self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Why an RPC failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Machine was not open when `send` was called
    #[error("machine is disconnected")]
    Disconnected,

    /// No response within the request timeout
    #[error("timed out")]
    Timeout,

    /// Owning machine was stopped while the request was pending
    #[error("stopped")]
    Stopped,

    /// Peer answered with an `error` field
    #[error("remote error: {0}")]
    Remote(String),

    /// Request could not be written to the channel
    #[error("send failed: {0}")]
    Transport(String),
}

/// Outcomes of connection scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    /// Local machines never connect outward
    #[error("only remote machines can schedule connections")]
    LocalMachine,

    /// Socket could not be opened or the handshake failed generically
    #[error("Failed to connect to host: {0}")]
    Connect(String),

    /// Machine was stopped before the attempt finished
    #[error("stopped")]
    Stopped,
}
