use std::io;
use thiserror::Error;

use crate::core::ConfigType;

/// 网关统一的错误类型
#[derive(Error, Debug)]
pub enum GatewayError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 对端在消息开始之前关闭了连接
    #[error("Stream ended before any message bytes were received")]
    StreamEnded,

    /// 消息被截断或格式错误，会话必须终止
    #[error("Corrupted framing: {0}")]
    CorruptedFraming(&'static str),

    /// 不支持的协议版本
    #[error("Unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// 不支持的命令
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// 客户端没有提供可接受的认证方式
    #[error("No acceptable authentication method offered")]
    NoAcceptableAuthMethod,

    /// 同一命名空间内重复注册协议
    #[error("Protocol '{name}' is already registered as {namespace}")]
    DuplicateRegistration { namespace: ConfigType, name: String },

    /// 未注册的协议
    #[error("Unknown {namespace} protocol '{name}'")]
    UnknownProtocol { namespace: ConfigType, name: String },

    /// 出站连接失败
    #[error("Failed to dial {destination}: {source}")]
    DialFailure {
        destination: String,
        #[source]
        source: io::Error,
    },

    /// 超时
    #[error("Timeout: {0}")]
    Timeout(&'static str),

    /// 其他错误
    #[error("{0}")]
    Other(String),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// 对端正常关闭，不需要按错误记录
    pub fn is_benign(&self) -> bool {
        matches!(self, GatewayError::StreamEnded)
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Config(format!("TOML parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: GatewayError = io_err.into();
        let display = format!("{}", err);
        assert!(display.contains("IO error"));
        assert!(display.contains("file not found"));
    }

    #[test]
    fn test_config_error_display() {
        let err = GatewayError::Config("invalid port".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Configuration error"));
        assert!(display.contains("invalid port"));
    }

    #[test]
    fn test_corrupted_framing_display() {
        let err = GatewayError::CorruptedFraming("truncated message");
        assert_eq!(format!("{}", err), "Corrupted framing: truncated message");
    }

    #[test]
    fn test_unsupported_version_display() {
        let err = GatewayError::UnsupportedVersion(4);
        assert_eq!(format!("{}", err), "Unsupported protocol version: 0x04");
    }

    #[test]
    fn test_duplicate_registration_display() {
        let err = GatewayError::DuplicateRegistration {
            namespace: ConfigType::Inbound,
            name: "socks".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Protocol 'socks' is already registered as inbound"
        );
    }

    #[test]
    fn test_unknown_protocol_display() {
        let err = GatewayError::UnknownProtocol {
            namespace: ConfigType::Outbound,
            name: "vmess".to_string(),
        };
        assert_eq!(format!("{}", err), "Unknown outbound protocol 'vmess'");
    }

    #[test]
    fn test_dial_failure_keeps_source() {
        use std::error::Error as _;

        let err = GatewayError::DialFailure {
            destination: "tcp:127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(format!("{}", err).contains("tcp:127.0.0.1:1"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_is_benign() {
        assert!(GatewayError::StreamEnded.is_benign());
        assert!(!GatewayError::CorruptedFraming("x").is_benign());
    }

    #[test]
    fn test_from_anyhow_error() {
        let anyhow_err = anyhow::anyhow!("some anyhow error");
        let err: GatewayError = anyhow_err.into();
        assert!(format!("{}", err).contains("some anyhow error"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("port = ").unwrap_err();
        let err: GatewayError = toml_err.into();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
