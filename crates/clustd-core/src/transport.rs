//! Transport abstraction for byte-stream sockets.
//!
//! The machine layer needs a reliable, ordered, bidirectional byte stream per
//! peer link. Message boundaries, ping/pong and the metadata header are
//! framed on top of it by the driver, so anything that yields such a stream
//! can carry clustd:
//!
//! - **TCP** (production via tokio, `clustd-node`)
//! - **Simulated TCP** (turmoil, `clustd-harness`)

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Opens outbound streams.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bidirectional stream type.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `host` (`address:port`).
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the host is unreachable or refuses.
    async fn connect(&self, host: &str) -> io::Result<Self::Stream>;
}

/// Accepts inbound streams.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// Bidirectional stream type.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound stream. Returns the stream and a printable
    /// peer address for logs.
    async fn accept(&self) -> io::Result<(Self::Stream, String)>;
}
