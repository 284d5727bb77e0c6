//! Transport layer abstraction
//!
//! Handlers see accepted connections as a boxed duplex byte stream plus
//! metadata about where it came from.

use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::Network;

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified transport stream type
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// Connection metadata
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
    /// Local address the connection arrived on
    pub local_addr: SocketAddr,
    /// Network of the listener
    pub network: Network,
}

impl ConnectionMeta {
    pub fn tcp(peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            local_addr,
            network: Network::Tcp,
        }
    }
}
