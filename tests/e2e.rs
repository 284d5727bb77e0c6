//! End-to-end tests: client -> point (inbound) -> freedom -> echo servers

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use raygate::config::{ConnConfig, FileConfig};
use raygate::core::{Address, ConfigType, Point, Registry, RunningPoint};
use raygate::proxy::socks::protocol::{
    read_auth_response, read_connect_response, AuthRequest, Command, ConnectRequest, AUTH_NONE,
    STATUS_SUCCESS,
};
use raygate::GatewayError;

const DATA: &str = "Data to be sent to remote.";

fn processed(data: &[u8]) -> Vec<u8> {
    let mut response = b"Processed: ".to_vec();
    response.extend_from_slice(data);
    response
}

/// TCP server answering each connection with "Processed: " + everything it read
async fn start_tcp_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                if socket.read_to_end(&mut request).await.is_ok() {
                    let _ = socket.write_all(&processed(&request)).await;
                }
            });
        }
    });
    addr
}

/// UDP server answering each datagram with "Processed: " + its payload
async fn start_udp_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&processed(&buf[..n]), from).await;
        }
    });
    addr
}

fn load_config(content: &str) -> FileConfig {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.toml");
    std::fs::write(&path, content).unwrap();
    FileConfig::load(&path).unwrap()
}

async fn start_point(content: &str) -> RunningPoint {
    let config = load_config(content);
    let registry = Registry::with_builtins().unwrap();
    let conn = ConnConfig {
        connect_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(5),
        ..ConnConfig::default()
    };
    let point = Point::new(&config.point, &registry, conn).unwrap();
    point.start(CancellationToken::new()).await.unwrap()
}

fn dokodemo_config(target: SocketAddr, network: &str) -> String {
    format!(
        r#"
[point]
listen = "127.0.0.1"
port = 0

[point.inbound]
protocol = "dokodemo-door"
settings = {{ address = "{}", port = {}, network = ["{}"], timeout = 0 }}

[point.outbound]
protocol = "freedom"
"#,
        target.ip(),
        target.port(),
        network
    )
}

const SOCKS_CONFIG: &str = r#"
[point]
listen = "127.0.0.1"
port = 0

[point.inbound]
protocol = "socks"
settings = { timeout = 30 }

[point.outbound]
protocol = "freedom"
"#;

async fn socks_connect(point: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(point).await.unwrap();
    let mut buf = BytesMut::new();
    AuthRequest::new(&[AUTH_NONE]).encode(&mut buf);
    client.write_all(&buf).await.unwrap();
    let auth = read_auth_response(&mut client).await.unwrap();
    assert_eq!(auth.method, AUTH_NONE);

    buf.clear();
    ConnectRequest::new(Command::Connect, Address::from(target)).encode(&mut buf);
    client.write_all(&buf).await.unwrap();

    let reply = read_connect_response(&mut client).await.unwrap();
    assert_eq!(reply.status, STATUS_SUCCESS);
    assert_eq!(reply.address, Address::IPv4([0; 4], 0));
    client
}

#[tokio::test]
async fn test_dokodemo_tcp() {
    let target = start_tcp_server().await;
    let running = start_point(&dokodemo_config(target, "tcp")).await;

    let mut client = TcpStream::connect(running.local_addr()).await.unwrap();
    client.write_all(DATA.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, processed(DATA.as_bytes()));

    running.shutdown().await;
}

#[tokio::test]
async fn test_dokodemo_udp() {
    let target = start_udp_server().await;
    let running = start_point(&dokodemo_config(target, "udp")).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(DATA.as_bytes(), running.local_addr())
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, running.local_addr());
    assert_eq!(&buf[..n], &processed(DATA.as_bytes())[..]);

    running.shutdown().await;
}

#[tokio::test]
async fn test_socks_connect() {
    let target = start_tcp_server().await;
    let running = start_point(SOCKS_CONFIG).await;

    let mut client = socks_connect(running.local_addr(), target).await;
    client.write_all(DATA.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, processed(DATA.as_bytes()));

    running.shutdown().await;
}

#[tokio::test]
async fn test_socks_dial_failure_closes_client() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let running = start_point(SOCKS_CONFIG).await;

    let mut client = socks_connect(running.local_addr(), closed).await;
    let mut response = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap();
    assert!(read.is_err() || response.is_empty());

    running.shutdown().await;
}

#[tokio::test]
async fn test_socks_rejects_auth_only_clients() {
    let running = start_point(SOCKS_CONFIG).await;

    let mut client = TcpStream::connect(running.local_addr()).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    running.shutdown().await;
}

#[test]
fn test_unknown_outbound_rejected() {
    let config = load_config(&SOCKS_CONFIG.replace("\"freedom\"", "\"vmess\""));
    let registry = Registry::with_builtins().unwrap();
    let err = Point::new(&config.point, &registry, ConnConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        GatewayError::UnknownProtocol {
            namespace: ConfigType::Outbound,
            ..
        }
    ));
}

#[test]
fn test_bad_settings_rejected() {
    let config = load_config(&SOCKS_CONFIG.replace("timeout = 30", "timeout = \"soon\""));
    let registry = Registry::with_builtins().unwrap();
    let err = Point::new(&config.point, &registry, ConnConfig::default()).unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
}
