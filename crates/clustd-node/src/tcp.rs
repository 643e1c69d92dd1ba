//! TCP transport.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use clustd_core::transport::{Acceptor, Transport};
use tokio::net::{TcpListener, TcpStream};

/// Opens outbound TCP streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn connect(&self, host: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(host).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Accepts inbound TCP streams.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind the listening socket.
    pub async fn bind(address: &str) -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(address).await? })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }
}
