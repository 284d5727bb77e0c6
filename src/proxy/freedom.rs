//! Freedom outbound
//!
//! Dials the packet's destination directly and relays the ray over it.

use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;

use crate::core::alloc::{self, SizeClass, LARGE_CHUNK_SIZE};
use crate::core::{
    copy, Chunk, Destination, Network, OutboundConnectionHandler, OutboundContext,
    OutboundProtocol, OutboundRay, Packet,
};
use crate::error::{GatewayError, Result};
use crate::logger::log;

/// `freedom` takes no settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FreedomConfig {}

pub struct Freedom;

impl OutboundProtocol for Freedom {
    const NAME: &'static str = "freedom";
    type Config = FreedomConfig;

    fn create(
        _config: FreedomConfig,
        ctx: &OutboundContext,
    ) -> Result<Arc<dyn OutboundConnectionHandler>> {
        Ok(Arc::new(FreedomHandler {
            connect_timeout: ctx.conn.connect_timeout,
            response_timeout: ctx.conn.idle_timeout,
            tcp_nodelay: ctx.conn.tcp_nodelay,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct FreedomHandler {
    connect_timeout: Duration,
    /// How long a UDP dial waits for its single response
    response_timeout: Duration,
    tcp_nodelay: bool,
}

fn dial_timeout() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
}

fn lost_half() -> GatewayError {
    GatewayError::Other("copy task ended without returning its socket half".to_string())
}

impl FreedomHandler {
    async fn dial_tcp(&self, destination: &Destination) -> io::Result<TcpStream> {
        let connect = async {
            let addr = destination.address().to_socket_addr().await?;
            TcpStream::connect(addr).await
        };
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| dial_timeout())??;
        if self.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(stream)
    }

    async fn dial_udp(&self, destination: &Destination) -> io::Result<UdpSocket> {
        let connect = async {
            let addr = destination.address().to_socket_addr().await?;
            let local: SocketAddr = match addr {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(addr).await?;
            Ok::<_, io::Error>(socket)
        };
        tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| dial_timeout())?
    }

    async fn relay_tcp(
        &self,
        destination: &Destination,
        stream: TcpStream,
        first: Option<Chunk>,
        more_chunks: bool,
        ray: OutboundRay,
    ) -> Result<()> {
        let OutboundRay { mut input, output } = ray;
        let (mut reader, mut writer) = stream.into_split();

        if let Some(chunk) = first {
            let written = writer.write_all(&chunk).await;
            chunk.release();
            if let Err(e) = written {
                log::debug!(destination = %destination, error = %e, "First chunk write failed");
            }
        }

        let (write_done, write_signal) = oneshot::channel();
        if more_chunks {
            let destination = destination.clone();
            tokio::spawn(async move {
                if let Err(e) = copy::chan_to_writer(&mut writer, &mut input).await {
                    log::debug!(destination = %destination, error = %e, "Upload ended");
                }
                input.discard();
                let _ = write_done.send(writer);
            });
        } else {
            input.discard();
            let _ = write_done.send(writer);
        }

        let (read_done, read_signal) = oneshot::channel();
        let peer = destination.clone();
        tokio::spawn(async move {
            match copy::reader_to_chan(&output, &mut reader).await {
                Ok(n) => log::debug!(destination = %peer, bytes = n, "Download finished"),
                Err(e) => log::debug!(destination = %peer, error = %e, "Download ended"),
            }
            output.close();
            let _ = read_done.send(reader);
        });

        let mut writer = write_signal.await.map_err(|_| lost_half())?;
        let _ = writer.shutdown().await;
        let reader = read_signal.await.map_err(|_| lost_half())?;
        drop(reader);
        drop(writer);
        Ok(())
    }

    async fn relay_udp(
        &self,
        destination: &Destination,
        socket: UdpSocket,
        first: Option<Chunk>,
        more_chunks: bool,
        ray: OutboundRay,
    ) -> Result<()> {
        let OutboundRay { mut input, output } = ray;
        let socket = Arc::new(socket);

        if let Some(chunk) = first {
            let sent = socket.send(&chunk).await;
            chunk.release();
            if let Err(e) = sent {
                log::debug!(destination = %destination, error = %e, "Datagram send failed");
            }
        }

        let (write_done, write_signal) = oneshot::channel();
        if more_chunks {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                while let Some(chunk) = input.recv().await {
                    let sent = socket.send(&chunk).await;
                    chunk.release();
                    if sent.is_err() {
                        break;
                    }
                }
                input.discard();
                let _ = write_done.send(());
            });
        } else {
            input.discard();
            let _ = write_done.send(());
        }

        // A UDP dial yields a single response datagram
        let (read_done, read_signal) = oneshot::channel();
        let reader = Arc::clone(&socket);
        let response_timeout = self.response_timeout;
        let peer = destination.clone();
        tokio::spawn(async move {
            let mut chunk = alloc::acquire(SizeClass::Large);
            match tokio::time::timeout(response_timeout, reader.recv_buf(chunk.buf_mut())).await {
                Ok(Ok(n)) if n > 0 => {
                    log::debug!(destination = %peer, bytes = n, "Datagram response");
                    if n >= LARGE_CHUNK_SIZE {
                        log::debug!(destination = %peer, "Datagram response may be truncated");
                    }
                    if let Err(chunk) = output.send(chunk).await {
                        chunk.release();
                    }
                }
                Ok(Ok(_)) => chunk.release(),
                Ok(Err(e)) => {
                    log::debug!(destination = %peer, error = %e, "Datagram receive failed");
                    chunk.release();
                }
                Err(_) => {
                    log::debug!(destination = %peer, "No datagram response before timeout");
                    chunk.release();
                }
            }
            output.close();
            let _ = read_done.send(());
        });

        write_signal.await.map_err(|_| lost_half())?;
        read_signal.await.map_err(|_| lost_half())?;
        Ok(())
    }
}

#[async_trait]
impl OutboundConnectionHandler for FreedomHandler {
    async fn dispatch(&self, packet: Packet, ray: OutboundRay) -> Result<()> {
        let (destination, first, more_chunks) = packet.into_parts();
        log::info!(destination = %destination, "Freedom: opening connection");

        let dialed = match destination.network() {
            Network::Tcp => self.dial_tcp(&destination).await.map(Dialed::Tcp),
            Network::Udp => self.dial_udp(&destination).await.map(Dialed::Udp),
        };
        let dialed = match dialed {
            Ok(dialed) => dialed,
            Err(source) => {
                let OutboundRay { input, output } = ray;
                output.close();
                input.discard();
                if let Some(chunk) = first {
                    chunk.release();
                }
                return Err(GatewayError::DialFailure {
                    destination: destination.to_string(),
                    source,
                });
            }
        };

        match dialed {
            Dialed::Tcp(stream) => {
                self.relay_tcp(&destination, stream, first, more_chunks, ray)
                    .await
            }
            Dialed::Udp(socket) => {
                self.relay_udp(&destination, socket, first, more_chunks, ray)
                    .await
            }
        }
    }
}

enum Dialed {
    Tcp(TcpStream),
    Udp(UdpSocket),
}
