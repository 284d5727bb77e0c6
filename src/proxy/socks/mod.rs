//! SOCKS5 inbound
//!
//! No-auth CONNECT only. The success reply is sent before the outbound dials,
//! so dial errors reach the client as a closed connection.

pub mod protocol;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use self::protocol::{
    read_auth_request, read_connect_request, AuthResponse, Command, ConnectResponse,
    AUTH_NONE, AUTH_NO_ACCEPTABLE, STATUS_COMMAND_NOT_SUPPORTED, STATUS_SUCCESS,
};
use crate::core::{
    Destination, InboundConnectionHandler, InboundContext, InboundProtocol, Network, Packet,
};
use crate::error::{GatewayError, Result};
use crate::logger::log;
use crate::transport::{ConnectionMeta, TransportStream};

/// `socks` settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SocksConfig {
    /// Idle seconds before a relay is dropped, 0 = never
    #[serde(default)]
    pub timeout: u64,
}

pub struct Socks;

impl InboundProtocol for Socks {
    const NAME: &'static str = "socks";
    type Config = SocksConfig;

    fn create(
        config: SocksConfig,
        _ctx: &InboundContext,
    ) -> Result<Arc<dyn InboundConnectionHandler>> {
        Ok(Arc::new(SocksHandler {
            idle_timeout: (config.timeout > 0).then(|| Duration::from_secs(config.timeout)),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct SocksHandler {
    idle_timeout: Option<Duration>,
}

#[async_trait]
impl InboundConnectionHandler for SocksHandler {
    fn networks(&self) -> &[Network] {
        &[Network::Tcp]
    }

    async fn handshake(
        &self,
        stream: &mut TransportStream,
        meta: &ConnectionMeta,
    ) -> Result<Packet> {
        let auth = read_auth_request(stream).await?;
        if !auth.has_auth_method(AUTH_NONE) {
            log::debug!(
                peer = %meta.peer_addr,
                methods = ?auth.methods(),
                "No acceptable SOCKS auth method"
            );
            AuthResponse::new(AUTH_NO_ACCEPTABLE).write_to(stream).await?;
            return Err(GatewayError::NoAcceptableAuthMethod);
        }
        AuthResponse::new(AUTH_NONE).write_to(stream).await?;

        let request = read_connect_request(stream).await?;
        match request.command() {
            Ok(Command::Connect) => {}
            _ => {
                ConnectResponse::unbound(STATUS_COMMAND_NOT_SUPPORTED)
                    .write_to(stream)
                    .await?;
                return Err(GatewayError::UnsupportedCommand(request.command));
            }
        }

        ConnectResponse::unbound(STATUS_SUCCESS).write_to(stream).await?;
        log::debug!(peer = %meta.peer_addr, destination = %request.address, "SOCKS CONNECT");
        Ok(Packet::new(Destination::tcp(request.address), None, true))
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }
}
