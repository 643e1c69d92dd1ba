//! Simulated TCP transport backed by turmoil.

use std::io;

use async_trait::async_trait;
use clustd_core::transport::{Acceptor, Transport};
use turmoil::net::{TcpListener, TcpStream};

/// Dials simulated hosts by `name:port`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimTransport;

#[async_trait]
impl Transport for SimTransport {
    type Stream = TcpStream;

    async fn connect(&self, host: &str) -> io::Result<TcpStream> {
        TcpStream::connect(host).await
    }
}

/// Listening socket on a simulated host.
pub struct SimAcceptor {
    listener: TcpListener,
}

impl SimAcceptor {
    /// Bind `address`, e.g. `0.0.0.0:4000`.
    pub async fn bind(address: &str) -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(address).await? })
    }
}

#[async_trait]
impl Acceptor for SimAcceptor {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((stream, peer.to_string()))
    }
}
