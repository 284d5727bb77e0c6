//! Dokodemo-door inbound
//!
//! Accepts anything and forwards it to one configured destination, without
//! reading a single byte of handshake.

use async_trait::async_trait;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    Address, Chunk, Destination, InboundConnectionHandler, InboundContext, InboundProtocol,
    Network, Packet,
};
use crate::error::{GatewayError, Result};
use crate::transport::{ConnectionMeta, TransportStream};

fn default_network() -> Vec<Network> {
    vec![Network::Tcp]
}

/// `dokodemo-door` settings
#[derive(Debug, Clone, Deserialize)]
pub struct DokodemoConfig {
    /// Target host, IP literal or domain
    pub address: String,
    pub port: u16,
    #[serde(default = "default_network")]
    pub network: Vec<Network>,
    /// Idle seconds before a relay is dropped, 0 = never
    #[serde(default)]
    pub timeout: u64,
}

pub struct DokodemoDoor;

impl InboundProtocol for DokodemoDoor {
    const NAME: &'static str = "dokodemo-door";
    type Config = DokodemoConfig;

    fn create(
        config: DokodemoConfig,
        _ctx: &InboundContext,
    ) -> Result<Arc<dyn InboundConnectionHandler>> {
        Ok(Arc::new(DokodemoHandler::new(config)?))
    }
}

/// Handler built from a [`DokodemoConfig`]
#[derive(Debug)]
pub struct DokodemoHandler {
    address: Address,
    networks: Vec<Network>,
    idle_timeout: Option<Duration>,
}

impl DokodemoHandler {
    pub fn new(config: DokodemoConfig) -> Result<Self> {
        if config.address.trim().is_empty() {
            return Err(GatewayError::Config(
                "dokodemo-door: address must not be empty".to_string(),
            ));
        }
        if config.port == 0 {
            return Err(GatewayError::Config(
                "dokodemo-door: port must not be 0".to_string(),
            ));
        }
        let mut networks = config.network;
        networks.dedup();
        if networks.is_empty() {
            networks = default_network();
        }
        Ok(Self {
            address: Address::from_host(config.address.trim(), config.port),
            networks,
            idle_timeout: (config.timeout > 0).then(|| Duration::from_secs(config.timeout)),
        })
    }
}

#[async_trait]
impl InboundConnectionHandler for DokodemoHandler {
    fn networks(&self) -> &[Network] {
        &self.networks
    }

    async fn handshake(
        &self,
        _stream: &mut TransportStream,
        _meta: &ConnectionMeta,
    ) -> Result<Packet> {
        Ok(Packet::new(Destination::tcp(self.address.clone()), None, true))
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    fn datagram_packet(&self, payload: Chunk, _from: SocketAddr) -> Result<Packet> {
        Ok(Packet::new(
            Destination::udp(self.address.clone()),
            Some(payload),
            false,
        ))
    }
}
