//! Connection handler roles
//!
//! Inbound handlers terminate the client side of a ray, outbound handlers the
//! destination side. Protocols plug in by implementing a handler trait and a
//! matching protocol marker, then registering the marker with the
//! [`Registry`](super::registry::Registry).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::alloc::Chunk;
use super::copy::{relay_stream, RelayResult};
use super::destination::{Network, Packet};
use super::ray::{InboundRay, OutboundRay};
use crate::config::ConnConfig;
use crate::error::{GatewayError, Result};
use crate::transport::{ConnectionMeta, TransportStream};

/// Client-facing side of a proxy
#[async_trait]
pub trait InboundConnectionHandler: Send + Sync {
    /// Networks this handler accepts on its listener port
    fn networks(&self) -> &[Network];

    /// Negotiate with the client and produce the first packet of the connection
    async fn handshake(&self, stream: &mut TransportStream, meta: &ConnectionMeta)
        -> Result<Packet>;

    /// Idle limit applied while relaying
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    /// Relay between the client and the ray once the outbound side is running
    async fn relay(
        &self,
        stream: TransportStream,
        ray: InboundRay,
        _meta: &ConnectionMeta,
    ) -> RelayResult {
        relay_stream(stream, ray, self.idle_timeout()).await
    }

    /// Turn one received datagram into a packet
    fn datagram_packet(&self, payload: Chunk, from: SocketAddr) -> Result<Packet> {
        payload.release();
        Err(GatewayError::Other(format!(
            "datagram from {} not supported by this inbound",
            from
        )))
    }
}

/// Destination-facing side of a proxy
#[async_trait]
pub trait OutboundConnectionHandler: Send + Sync {
    /// Connect to the packet's destination and relay the ray until both directions close
    async fn dispatch(&self, packet: Packet, ray: OutboundRay) -> Result<()>;
}

/// Shared collaborators handed to inbound factories
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub conn: ConnConfig,
}

/// Shared collaborators handed to outbound factories
#[derive(Debug, Clone)]
pub struct OutboundContext {
    pub conn: ConnConfig,
}

/// Marker pairing an inbound config type with its handler constructor
pub trait InboundProtocol: 'static {
    /// Registry key
    const NAME: &'static str;
    type Config: DeserializeOwned + Send + Sync + 'static;

    fn create(
        config: Self::Config,
        ctx: &InboundContext,
    ) -> Result<Arc<dyn InboundConnectionHandler>>;
}

/// Marker pairing an outbound config type with its handler constructor
pub trait OutboundProtocol: 'static {
    /// Registry key
    const NAME: &'static str;
    type Config: DeserializeOwned + Send + Sync + 'static;

    fn create(
        config: Self::Config,
        ctx: &OutboundContext,
    ) -> Result<Arc<dyn OutboundConnectionHandler>>;
}
