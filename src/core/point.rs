//! Point: one listener wired to an inbound and an outbound protocol
//!
//! Binding, the accept loop and per-connection lifecycle live here. Each
//! accepted connection is handshaken by the inbound handler, dispatched to the
//! outbound handler through a fresh ray, then relayed until both directions
//! close.

use socket2::{SockRef, TcpKeepalive};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::alloc::{self, SizeClass, LARGE_CHUNK_SIZE};
use super::destination::Network;
use super::dispatcher::Dispatcher;
use super::handler::{InboundConnectionHandler, InboundContext, OutboundContext};
use super::ray::InboundRay;
use super::registry::{ConfigType, Registry};
use crate::config::{ConnConfig, PointConfig};
use crate::error::{GatewayError, Result};
use crate::logger::log;
use crate::transport::{ConnectionMeta, TransportStream};

/// TCP keepalive interval, dead peers are detected after ~3 unanswered keepalives
const TCP_KEEPALIVE_SECS: u64 = 15;

fn unknown(namespace: ConfigType, name: &str) -> GatewayError {
    GatewayError::UnknownProtocol {
        namespace,
        name: name.to_string(),
    }
}

/// A configured but not yet listening point
pub struct Point {
    listen: IpAddr,
    port: u16,
    inbound_name: String,
    inbound: Arc<dyn InboundConnectionHandler>,
    dispatcher: Dispatcher,
    conn: ConnConfig,
}

impl Point {
    /// Resolve both protocols through `registry` and build their handlers
    pub fn new(config: &PointConfig, registry: &Registry, conn: ConnConfig) -> Result<Self> {
        let listen: IpAddr = config.listen.parse().map_err(|_| {
            GatewayError::Config(format!("invalid listen address '{}'", config.listen))
        })?;

        let inbound_name = config.inbound.protocol.as_str();
        let inbound_config = registry
            .create_config(inbound_name, ConfigType::Inbound, &config.inbound.settings)
            .ok_or_else(|| unknown(ConfigType::Inbound, inbound_name))??;
        let inbound = registry
            .create_inbound_handler(inbound_name, inbound_config, &InboundContext { conn })
            .ok_or_else(|| unknown(ConfigType::Inbound, inbound_name))??;

        let outbound_name = config.outbound.protocol.as_str();
        let outbound_config = registry
            .create_config(outbound_name, ConfigType::Outbound, &config.outbound.settings)
            .ok_or_else(|| unknown(ConfigType::Outbound, outbound_name))??;
        let outbound = registry
            .create_outbound_handler(outbound_name, outbound_config, &OutboundContext { conn })
            .ok_or_else(|| unknown(ConfigType::Outbound, outbound_name))??;

        Ok(Self {
            listen,
            port: config.port,
            inbound_name: inbound_name.to_string(),
            inbound,
            dispatcher: Dispatcher::new(outbound, outbound_name, conn.ray_capacity),
            conn,
        })
    }

    /// Bind the listener(s) and start accepting
    ///
    /// TCP is bound first when the inbound accepts it; UDP then binds the same
    /// port so a port of 0 resolves to one shared number.
    pub async fn start(self, cancel: CancellationToken) -> Result<RunningPoint> {
        let networks = self.inbound.networks().to_vec();
        if networks.is_empty() {
            return Err(GatewayError::Config(format!(
                "inbound '{}' accepts no network",
                self.inbound_name
            )));
        }

        let addr = SocketAddr::new(self.listen, self.port);
        let listener = if networks.contains(&Network::Tcp) {
            Some(bind_tcp(addr, self.conn.tcp_backlog)?)
        } else {
            None
        };
        let udp_addr = match &listener {
            Some(l) => l.local_addr()?,
            None => addr,
        };
        let socket = if networks.contains(&Network::Udp) {
            Some(Arc::new(UdpSocket::bind(udp_addr).await?))
        } else {
            None
        };
        let local_addr = match (&listener, &socket) {
            (Some(l), _) => l.local_addr()?,
            (None, Some(s)) => s.local_addr()?,
            (None, None) => {
                return Err(GatewayError::Config(format!(
                    "inbound '{}' accepts neither tcp nor udp",
                    self.inbound_name
                )))
            }
        };

        let limiter = if self.conn.max_connections > 0 {
            Some(Arc::new(Semaphore::new(self.conn.max_connections)))
        } else {
            None
        };

        log::info!(
            address = %local_addr,
            inbound = %self.inbound_name,
            outbound = %self.dispatcher.outbound_name(),
            tcp = listener.is_some(),
            udp = socket.is_some(),
            max_connections = self.conn.max_connections,
            "Point started"
        );

        let active = Arc::new(AtomicUsize::new(0));
        let point = Arc::new(self);
        let mut tasks = Vec::new();
        if let Some(listener) = listener {
            tasks.push(tokio::spawn(Arc::clone(&point).accept_loop(
                listener,
                cancel.clone(),
                limiter,
                Arc::clone(&active),
            )));
        }
        if let Some(socket) = socket {
            tasks.push(tokio::spawn(
                Arc::clone(&point).datagram_loop(socket, cancel.clone()),
            ));
        }

        Ok(RunningPoint {
            local_addr,
            cancel,
            active,
            tasks,
        })
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
        limiter: Option<Arc<Semaphore>>,
        active: Arc<AtomicUsize>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let peer_addr = peer.to_string();
                    log::connection(&peer_addr, "new");

                    // Backpressure when at the connection limit; cancellation still wins
                    let permit = match &limiter {
                        Some(limiter) => tokio::select! {
                            _ = cancel.cancelled() => break,
                            permit = limiter.clone().acquire_owned() => match permit {
                                Ok(permit) => Some(permit),
                                Err(_) => break,
                            },
                        },
                        None => None,
                    };

                    let point = Arc::clone(&self);
                    let active = Arc::clone(&active);
                    tokio::spawn(async move {
                        let _permit = permit;
                        active.fetch_add(1, Ordering::Relaxed);
                        let _guard = scopeguard::guard(peer_addr, |peer_addr| {
                            active.fetch_sub(1, Ordering::Relaxed);
                            log::connection(&peer_addr, "closed");
                        });

                        if let Err(e) = point.handle_stream(stream, peer).await {
                            if e.is_benign() {
                                log::debug!(peer = %peer, error = %e, "Connection ended");
                            } else {
                                log::protocol("handshake", Some(&e.to_string()));
                            }
                        }
                    });
                }
                Err(e) => {
                    log::error!(error = %e, "Failed to accept connection");
                    if e.kind() == std::io::ErrorKind::Other {
                        break;
                    }
                }
            }
        }
        log::debug!("Accept loop stopped");
    }

    async fn handle_stream(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if self.conn.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
            .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
        let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

        let meta = ConnectionMeta::tcp(peer, stream.local_addr()?);
        let mut stream: TransportStream = Box::pin(stream);

        // A failed handshake drops the stream without ever opening a ray
        let packet = match tokio::time::timeout(
            self.conn.handshake_timeout,
            self.inbound.handshake(&mut stream, &meta),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(GatewayError::Timeout("inbound handshake")),
        };
        log::protocol("handshake", None);

        let ray = self.dispatcher.dispatch_to_outbound(packet);
        let result = self.inbound.relay(stream, ray, &meta).await;
        log::debug!(
            peer = %peer,
            uploaded = result.uploaded,
            downloaded = result.downloaded,
            completed = result.completed,
            "Relay finished"
        );
        Ok(())
    }

    async fn datagram_loop(self: Arc<Self>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
        loop {
            let mut chunk = alloc::acquire(SizeClass::Large);
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_buf_from(chunk.buf_mut()) => received,
            };
            let from = match received {
                Ok((n, from)) => {
                    if n >= LARGE_CHUNK_SIZE {
                        log::debug!(peer = %from, bytes = n, "Datagram may be truncated");
                    }
                    from
                }
                Err(e) => {
                    log::debug!(error = %e, "Datagram receive failed");
                    continue;
                }
            };

            let packet = match self.inbound.datagram_packet(chunk, from) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!(peer = %from, error = %e, "Datagram dropped");
                    continue;
                }
            };

            // One datagram is the whole request; responses flow back to its sender
            let InboundRay { mut input, output } = self.dispatcher.dispatch_to_outbound(packet);
            output.close();
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                while let Some(chunk) = input.recv().await {
                    let sent = socket.send_to(&chunk, from).await;
                    chunk.release();
                    if let Err(e) = sent {
                        log::debug!(peer = %from, error = %e, "Datagram response failed");
                        break;
                    }
                }
                input.discard();
            });
        }
        log::debug!("Datagram loop stopped");
    }
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Point")
            .field("listen", &self.listen)
            .field("port", &self.port)
            .field("inbound", &self.inbound_name)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
fn bind_tcp(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Handle to a listening point
pub struct RunningPoint {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningPoint {
    /// Address actually bound, with port 0 resolved
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently between accept and close
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Stop accepting and wait for the listener tasks
    ///
    /// Connections already accepted run until their own streams close.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Wait until the point stops accepting
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!(error = %e, "Listener task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::core::{Address, Destination, OutboundConnectionHandler, OutboundRay, Packet};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Expects a single '+' byte; every connection targets a fixed address
    struct LineInbound;

    #[async_trait]
    impl InboundConnectionHandler for LineInbound {
        fn networks(&self) -> &[Network] {
            &[Network::Tcp]
        }

        async fn handshake(
            &self,
            stream: &mut TransportStream,
            _meta: &ConnectionMeta,
        ) -> Result<Packet> {
            let mut first = [0u8; 1];
            if stream.read(&mut first).await? == 0 {
                return Err(GatewayError::StreamEnded);
            }
            if first[0] != b'+' {
                return Err(GatewayError::CorruptedFraming("expected '+'"));
            }
            Ok(Packet::new(
                Destination::tcp(Address::IPv4([127, 0, 0, 1], 9)),
                None,
                true,
            ))
        }
    }

    /// Upper-cases everything it receives
    struct Upper;

    #[async_trait]
    impl OutboundConnectionHandler for Upper {
        async fn dispatch(&self, _packet: Packet, mut ray: OutboundRay) -> Result<()> {
            while let Some(chunk) = ray.input.recv().await {
                let mut out = alloc::acquire(SizeClass::Small);
                out.extend_from_slice(&chunk.to_ascii_uppercase());
                chunk.release();
                if ray.output.send(out).await.is_err() {
                    break;
                }
            }
            ray.output.close();
            Ok(())
        }
    }

    fn test_registry() -> Registry {
        let registry = Registry::new();
        registry
            .register_inbound_config("line", |_| Ok(Box::new(())))
            .unwrap();
        registry
            .register_inbound_handler("line", |_, _| {
                Ok(Arc::new(LineInbound) as Arc<dyn InboundConnectionHandler>)
            })
            .unwrap();
        registry
            .register_outbound_config("upper", |_| Ok(Box::new(())))
            .unwrap();
        registry
            .register_outbound_handler("upper", |_, _| {
                Ok(Arc::new(Upper) as Arc<dyn OutboundConnectionHandler>)
            })
            .unwrap();
        registry
    }

    fn point_config(inbound: &str, outbound: &str) -> PointConfig {
        PointConfig {
            listen: "127.0.0.1".to_string(),
            port: 0,
            inbound: ConnectionConfig {
                protocol: inbound.to_string(),
                settings: toml::Value::Table(Default::default()),
            },
            outbound: ConnectionConfig {
                protocol: outbound.to_string(),
                settings: toml::Value::Table(Default::default()),
            },
        }
    }

    #[test]
    fn test_unknown_protocols_rejected() {
        let registry = test_registry();
        let err = Point::new(&point_config("nope", "upper"), &registry, ConnConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UnknownProtocol { namespace: ConfigType::Inbound, .. }
        ));

        let err = Point::new(&point_config("line", "nope"), &registry, ConnConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UnknownProtocol { namespace: ConfigType::Outbound, .. }
        ));
    }

    #[tokio::test]
    async fn test_point_relays_through_outbound() {
        let registry = test_registry();
        let point =
            Point::new(&point_config("line", "upper"), &registry, ConnConfig::default()).unwrap();
        let running = point.start(CancellationToken::new()).await.unwrap();
        assert_ne!(running.local_addr().port(), 0);

        let mut client = TcpStream::connect(running.local_addr()).await.unwrap();
        client.write_all(b"+hello").await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HELLO");

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_connection() {
        let registry = test_registry();
        let point =
            Point::new(&point_config("line", "upper"), &registry, ConnConfig::default()).unwrap();
        let running = point.start(CancellationToken::new()).await.unwrap();

        let mut client = TcpStream::connect(running.local_addr()).await.unwrap();
        client.write_all(b"-hello").await.unwrap();

        let mut out = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let registry = test_registry();
        let conn = ConnConfig {
            handshake_timeout: Duration::from_millis(100),
            ..ConnConfig::default()
        };
        let point = Point::new(&point_config("line", "upper"), &registry, conn).unwrap();
        let running = point.start(CancellationToken::new()).await.unwrap();

        let mut client = TcpStream::connect(running.local_addr()).await.unwrap();
        let mut out = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_accepting() {
        let registry = test_registry();
        let point =
            Point::new(&point_config("line", "upper"), &registry, ConnConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        let running = point.start(cancel.clone()).await.unwrap();
        let addr = running.local_addr();

        cancel.cancel();
        running.wait().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    async fn wait_for_active(running: &RunningPoint, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while running.active_connections() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn limited(max_connections: usize) -> ConnConfig {
        ConnConfig {
            max_connections,
            ..ConnConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connection_limit_holds_extra_client() {
        let registry = test_registry();
        let point = Point::new(&point_config("line", "upper"), &registry, limited(1)).unwrap();
        let running = point.start(CancellationToken::new()).await.unwrap();

        let mut first = TcpStream::connect(running.local_addr()).await.unwrap();
        first.write_all(b"+").await.unwrap();
        wait_for_active(&running, 1).await;

        let mut second = TcpStream::connect(running.local_addr()).await.unwrap();
        second.write_all(b"+abc").await.unwrap();
        second.shutdown().await.unwrap();

        // Not served while the first connection holds the only slot
        let mut buf = [0u8; 8];
        let held = tokio::time::timeout(Duration::from_millis(300), second.read(&mut buf)).await;
        assert!(held.is_err());
        assert_eq!(running.active_connections(), 1);

        first.shutdown().await.unwrap();
        let mut out = Vec::new();
        first.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());

        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), second.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"ABC");

        wait_for_active(&running, 0).await;
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_at_connection_limit() {
        let registry = test_registry();
        let point = Point::new(&point_config("line", "upper"), &registry, limited(1)).unwrap();
        let running = point.start(CancellationToken::new()).await.unwrap();
        let addr = running.local_addr();

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"+").await.unwrap();
        wait_for_active(&running, 1).await;

        // Accepted, then parked waiting for a slot
        let _second = TcpStream::connect(addr).await.unwrap();
        let _third = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), running.shutdown())
            .await
            .expect("shutdown blocked on the connection limit");
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
