//! Configuration module
//!
//! CLI arguments (with environment variable support) carry connection tuning;
//! the TOML file describes the listener and its inbound/outbound protocols.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::DEFAULT_RAY_CAPACITY;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// CLI arguments for the gateway
///
/// Supports environment variables with RAYGATE_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Protocol-agnostic proxy gateway")]
pub struct CliArgs {
    /// Gateway configuration file (.toml)
    #[arg(short = 'c', long = "config", env = "RAYGATE_CONFIG")]
    pub config: PathBuf,

    /// Log level: trace, debug, info, warn, error (overrides [log] level)
    #[arg(long = "log-level", env = "RAYGATE_LOG_LEVEL")]
    pub log_level: Option<String>,

    // ==================== Performance Tuning ====================
    /// Timeout for the inbound handshake (default: 5s)
    #[arg(long, env = "RAYGATE_HANDSHAKE_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub handshake_timeout: Duration,

    /// Outbound connect timeout (default: 5s)
    #[arg(long, env = "RAYGATE_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// How long an outbound UDP dial waits for its response (default: 5m)
    #[arg(long, env = "RAYGATE_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub idle_timeout: Duration,

    /// Chunks buffered per ray direction before writers wait (default: 16)
    #[arg(long, env = "RAYGATE_RAY_CAPACITY", default_value_t = DEFAULT_RAY_CAPACITY, help_heading = "Performance")]
    pub ray_capacity: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "RAYGATE_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "RAYGATE_TCP_NODELAY",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Maximum concurrent connections, 0 = unlimited (default: 0)
    #[arg(
        long,
        env = "RAYGATE_MAX_CONNECTIONS",
        default_value_t = 0,
        help_heading = "Performance"
    )]
    pub max_connections: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file not found: {}",
                self.config.display()
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow!("handshake_timeout must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout must be greater than 0"));
        }
        if self.ray_capacity == 0 {
            return Err(anyhow!("ray_capacity must be greater than 0"));
        }
        Ok(())
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Inbound handshake timeout
    pub handshake_timeout: Duration,
    /// Outbound connect timeout
    pub connect_timeout: Duration,
    /// Outbound UDP response wait
    pub idle_timeout: Duration,
    /// Chunks buffered per ray direction
    pub ray_capacity: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Connection limit, 0 = unlimited
    pub max_connections: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            ray_capacity: DEFAULT_RAY_CAPACITY,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            handshake_timeout: cli.handshake_timeout,
            connect_timeout: cli.connect_timeout,
            idle_timeout: cli.idle_timeout,
            ray_capacity: cli.ray_capacity,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            max_connections: cli.max_connections,
        }
    }
}

fn empty_settings() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// One side of a point: protocol name plus its opaque settings
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub protocol: String,
    #[serde(default = "empty_settings")]
    pub settings: toml::Value,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

/// A listener with its inbound and outbound protocols
#[derive(Debug, Clone, Deserialize)]
pub struct PointConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub port: u16,
    pub inbound: ConnectionConfig,
    pub outbound: ConnectionConfig,
}

/// `[log]` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    pub level: Option<String>,
}

/// Gateway configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub point: PointConfig,
}

impl FileConfig {
    /// Read, parse and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: FileConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.point.inbound.protocol.trim().is_empty() {
            return Err(anyhow!("point.inbound.protocol must not be empty"));
        }
        if self.point.outbound.protocol.trim().is_empty() {
            return Err(anyhow!("point.outbound.protocol must not be empty"));
        }
        if self.point.listen.parse::<std::net::IpAddr>().is_err() {
            return Err(anyhow!(
                "point.listen must be an IP address, got '{}'",
                self.point.listen
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[log]
level = "debug"

[point]
port = 1080

[point.inbound]
protocol = "dokodemo-door"
settings = { address = "127.0.0.1", port = 8080, network = ["tcp", "udp"], timeout = 30 }

[point.outbound]
protocol = "freedom"
"#;

    fn create_test_cli_args(config: PathBuf) -> CliArgs {
        CliArgs {
            config,
            log_level: None,
            handshake_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            ray_capacity: 16,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_sample_config() {
        let config = FileConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert_eq!(config.point.listen, "0.0.0.0");
        assert_eq!(config.point.port, 1080);
        assert_eq!(config.point.inbound.protocol, "dokodemo-door");
        assert_eq!(
            config.point.inbound.settings.get("port").and_then(|v| v.as_integer()),
            Some(8080)
        );
        assert_eq!(config.point.outbound.protocol, "freedom");
        assert!(config.point.outbound.settings.as_table().unwrap().is_empty());
    }

    #[test]
    fn test_empty_protocol_rejected() {
        let content = SAMPLE.replace("\"freedom\"", "\"\"");
        assert!(FileConfig::parse(&content).is_err());
    }

    #[test]
    fn test_bad_listen_rejected() {
        let content = SAMPLE.replace("port = 1080", "listen = \"localhost\"\nport = 1080");
        assert!(FileConfig::parse(&content).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.point.port, 1080);

        assert!(FileConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_cli_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let cli = create_test_cli_args(path.clone());
        assert!(cli.validate().is_ok());

        let mut cli = create_test_cli_args(path.clone());
        cli.ray_capacity = 0;
        assert!(cli.validate().is_err());

        let cli = create_test_cli_args(dir.path().join("missing.toml"));
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_conn_config_from_cli() {
        let mut cli = create_test_cli_args(PathBuf::from("/tmp/x.toml"));
        cli.max_connections = 64;
        cli.tcp_nodelay = false;
        let conn = ConnConfig::from_cli(&cli);
        assert_eq!(conn.max_connections, 64);
        assert!(!conn.tcp_nodelay);
        assert_eq!(conn.ray_capacity, 16);
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = CliArgs::try_parse_from([
            "raygate",
            "-c",
            "/etc/raygate.toml",
            "--connect-timeout",
            "2s",
            "--tcp-nodelay",
            "false",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/raygate.toml"));
        assert_eq!(cli.connect_timeout, Duration::from_secs(2));
        assert!(!cli.tcp_nodelay);
        assert_eq!(cli.handshake_timeout, Duration::from_secs(5));
    }
}
