//! Destinations and packets
//!
//! The address encoding shared by handshake protocols:
//! - ATYP (1 byte: IPv4=1, DOMAIN=3, IPv6=4)
//! - address (4 bytes, 1 length byte + name, or 16 bytes)
//! - port (2 bytes, big-endian)

use bytes::BufMut;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::lookup_host;

use super::alloc::Chunk;
use crate::error::{GatewayError, Result};

/// Address type constants
pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

/// Address: literal IP or domain name, with port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::IPv4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => Address::IPv6(ip.octets(), addr.port()),
        }
    }
}

/// Read exactly `buf.len()` bytes of a field that follows already-consumed message bytes
async fn read_field<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(GatewayError::CorruptedFraming("truncated address"))
        }
        Err(e) => Err(e.into()),
    }
}

impl Address {
    /// Build from a host string, parsing literal IPs first
    pub fn from_host(host: &str, port: u16) -> Self {
        if let Ok(ipv4) = host.parse::<Ipv4Addr>() {
            return Address::IPv4(ipv4.octets(), port);
        }
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ipv6) = trimmed.parse::<Ipv6Addr>() {
            return Address::IPv6(ipv6.octets(), port);
        }
        Address::Domain(host.to_string(), port)
    }

    /// ATYP tag for this address
    pub fn atyp(&self) -> u8 {
        match self {
            Address::IPv4(..) => ATYP_IPV4,
            Address::IPv6(..) => ATYP_IPV6,
            Address::Domain(..) => ATYP_DOMAIN,
        }
    }

    /// Read `ATYP + address + port` from a stream
    ///
    /// The caller has already consumed part of the message, so any EOF here
    /// is a framing error.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut atyp = [0u8; 1];
        read_field(reader, &mut atyp).await?;

        let address = match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                read_field(reader, &mut buf).await?;
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[..4]);
                Address::IPv4(ip, u16::from_be_bytes([buf[4], buf[5]]))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                read_field(reader, &mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                Address::IPv6(ip, u16::from_be_bytes([buf[16], buf[17]]))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                read_field(reader, &mut len).await?;
                let mut buf = vec![0u8; len[0] as usize + 2];
                read_field(reader, &mut buf).await?;
                let name_len = len[0] as usize;
                let domain = std::str::from_utf8(&buf[..name_len])
                    .map_err(|_| GatewayError::CorruptedFraming("invalid domain encoding"))?
                    .to_string();
                Address::Domain(domain, u16::from_be_bytes([buf[name_len], buf[name_len + 1]]))
            }
            _ => return Err(GatewayError::CorruptedFraming("invalid address type")),
        };
        Ok(address)
    }

    /// Encode `ATYP + address + port`, returning the number of bytes written
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> usize {
        match self {
            Address::IPv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(ip);
                buf.put_u16(*port);
                7
            }
            Address::IPv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(ip);
                buf.put_u16(*port);
                19
            }
            Address::Domain(domain, port) => {
                // A length byte frames at most 255 bytes; cut on a char boundary below that
                let mut end = domain.len().min(u8::MAX as usize);
                while !domain.is_char_boundary(end) {
                    end -= 1;
                }
                let name = &domain.as_bytes()[..end];
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name);
                buf.put_u16(*port);
                4 + name.len()
            }
        }
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host string (IP or domain)
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Resolve to socket address
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port)),
            Address::IPv6(ip, port) => Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port)),
            Address::Domain(domain, port) => {
                let addr_str = format!("{}:{}", domain, port);
                let mut addrs = lookup_host(&addr_str).await?;
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                })
            }
        }
    }
}

/// Network kind of a destination or listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Where an outbound handler should connect
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    network: Network,
    address: Address,
}

impl Destination {
    pub fn new(network: Network, address: Address) -> Self {
        Self { network, address }
    }

    pub fn tcp(address: Address) -> Self {
        Self::new(Network::Tcp, address)
    }

    pub fn udp(address: Address) -> Self {
        Self::new(Network::Udp, address)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_udp(&self) -> bool {
        self.network == Network::Udp
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

/// First packet of a logical connection, produced by an inbound handshake
#[derive(Debug)]
pub struct Packet {
    destination: Destination,
    chunk: Option<Chunk>,
    more_chunks: bool,
}

impl Packet {
    pub fn new(destination: Destination, chunk: Option<Chunk>, more_chunks: bool) -> Self {
        Self {
            destination,
            chunk,
            more_chunks,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Whether further chunks follow on the ray after this packet
    pub fn more_chunks(&self) -> bool {
        self.more_chunks
    }

    /// Consume the packet
    pub fn into_parts(self) -> (Destination, Option<Chunk>, bool) {
        (self.destination, self.chunk, self.more_chunks)
    }
}
