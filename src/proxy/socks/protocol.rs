//! SOCKS5 wire messages (RFC 1928)
//!
//! Messages are read field by field straight from the stream:
//! - AuthRequest:     VER NMETHODS METHODS...
//! - AuthResponse:    VER METHOD
//! - ConnectRequest:  VER CMD RSV ATYP DST.ADDR DST.PORT
//! - ConnectResponse: VER REP RSV ATYP BND.ADDR BND.PORT

use bytes::{BufMut, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::Address;
use crate::error::{GatewayError, Result};

pub const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_GSSAPI: u8 = 0x01;
pub const AUTH_USER_PASS: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// Reply status codes
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_GENERAL_FAILURE: u8 = 0x01;
pub const STATUS_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const STATUS_NETWORK_UNREACHABLE: u8 = 0x03;
pub const STATUS_HOST_UNREACHABLE: u8 = 0x04;
pub const STATUS_CONNECTION_REFUSED: u8 = 0x05;
pub const STATUS_TTL_EXPIRED: u8 = 0x06;
pub const STATUS_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const STATUS_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 request commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 1,
    Bind = 2,
    UdpAssociate = 3,
}

impl TryFrom<u8> for Command {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Command::Connect),
            2 => Ok(Command::Bind),
            3 => Ok(Command::UdpAssociate),
            other => Err(GatewayError::UnsupportedCommand(other)),
        }
    }
}

/// Read the fixed-size header that opens a message
///
/// Zero bytes before EOF means the peer never started the message.
async fn read_header<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                GatewayError::StreamEnded
            } else {
                GatewayError::CorruptedFraming("truncated header")
            });
        }
        filled += n;
    }
    Ok(())
}

/// Read a field that follows the header
async fn read_body<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            Err(GatewayError::CorruptedFraming("truncated message"))
        }
        Err(e) => Err(e.into()),
    }
}

fn check_version(version: u8) -> Result<()> {
    if version != SOCKS_VERSION {
        return Err(GatewayError::UnsupportedVersion(version));
    }
    Ok(())
}

/// Method negotiation sent by the client
#[derive(Debug, Clone)]
pub struct AuthRequest {
    version: u8,
    nmethods: u8,
    methods: [u8; 256],
}

impl AuthRequest {
    pub fn new(methods: &[u8]) -> Self {
        let nmethods = methods.len().min(u8::MAX as usize);
        let mut stored = [0u8; 256];
        stored[..nmethods].copy_from_slice(&methods[..nmethods]);
        Self {
            version: SOCKS_VERSION,
            nmethods: nmethods as u8,
            methods: stored,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Methods actually offered, the first `nmethods` entries
    pub fn methods(&self) -> &[u8] {
        &self.methods[..self.nmethods as usize]
    }

    pub fn has_auth_method(&self, method: u8) -> bool {
        self.methods().contains(&method)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.nmethods);
        buf.put_slice(self.methods());
    }
}

pub async fn read_auth_request<R>(reader: &mut R) -> Result<AuthRequest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 2];
    read_header(reader, &mut header).await?;
    check_version(header[0])?;

    let nmethods = header[1];
    let mut methods = [0u8; 256];
    read_body(reader, &mut methods[..nmethods as usize]).await?;
    Ok(AuthRequest {
        version: header[0],
        nmethods,
        methods,
    })
}

/// Server's method selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResponse {
    pub version: u8,
    pub method: u8,
}

impl AuthResponse {
    pub fn new(method: u8) -> Self {
        Self {
            version: SOCKS_VERSION,
            method,
        }
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        [self.version, self.method]
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

pub async fn read_auth_response<R>(reader: &mut R) -> Result<AuthResponse>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 2];
    read_header(reader, &mut buf).await?;
    check_version(buf[0])?;
    Ok(AuthResponse {
        version: buf[0],
        method: buf[1],
    })
}

/// Client request naming the destination
///
/// The command byte is kept raw so the server can answer an unknown command
/// with a status before failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: u8,
    pub command: u8,
    pub address: Address,
}

impl ConnectRequest {
    pub fn new(command: Command, address: Address) -> Self {
        Self {
            version: SOCKS_VERSION,
            command: command as u8,
            address,
        }
    }

    pub fn command(&self) -> Result<Command> {
        Command::try_from(self.command)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.command);
        buf.put_u8(0x00);
        self.address.encode(buf);
    }
}

pub async fn read_connect_request<R>(reader: &mut R) -> Result<ConnectRequest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 3];
    read_header(reader, &mut header).await?;
    check_version(header[0])?;

    let address = Address::read_from(reader).await?;
    Ok(ConnectRequest {
        version: header[0],
        command: header[1],
        address,
    })
}

/// Server reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub version: u8,
    pub status: u8,
    pub address: Address,
}

impl ConnectResponse {
    pub fn new(status: u8, address: Address) -> Self {
        Self {
            version: SOCKS_VERSION,
            status,
            address,
        }
    }

    /// Reply carrying the unspecified bind address 0.0.0.0:0
    pub fn unbound(status: u8) -> Self {
        Self::new(status, Address::IPv4([0; 4], 0))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.status);
        buf.put_u8(0x00);
        self.address.encode(buf);
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = BytesMut::with_capacity(262);
        self.encode(&mut buf);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

pub async fn read_connect_response<R>(reader: &mut R) -> Result<ConnectResponse>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 3];
    read_header(reader, &mut header).await?;
    check_version(header[0])?;

    let address = Address::read_from(reader).await?;
    Ok(ConnectResponse {
        version: header[0],
        status: header[1],
        address,
    })
}
