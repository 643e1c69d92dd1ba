//! Node runtime errors.

use std::io;

use clustd_core::{ChannelError, MachineError};
use clustd_proto::{MachineType, Opcode, ProtocolError};
use thiserror::Error;

/// Errors from the node runtime.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Socket I/O failed
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Bytes on the wire did not parse
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Metadata header did not authenticate
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Connection scheduling failed
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// First frame of an inbound socket was not the metadata header
    #[error("expected metadata frame, got {0:?}")]
    UnexpectedFrame(Opcode),

    /// Inbound socket went quiet before sending its metadata header
    #[error("timed out waiting for connection metadata")]
    MetadataTimeout,

    /// Inbound socket closed before sending its metadata header
    #[error("connection closed before metadata")]
    ClosedEarly,

    /// No handler registered for a machine type
    #[error("no handler registered for machine type {0}")]
    NoHandler(MachineType),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}
