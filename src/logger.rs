use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// 从字符串解析日志级别
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// 从命令行或配置文件的 `[log] level` 中读取日志级别
pub fn get_log_level_from_args() -> Option<LogLevel> {
    let args: Vec<String> = std::env::args().collect();
    log_level_from(&args)
}

fn log_level_from(args: &[String]) -> Option<LogLevel> {
    let log_level_from_cli = args
        .iter()
        .position(|a| a == "--log-level")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| LogLevel::parse(s));

    if log_level_from_cli.is_some() {
        return log_level_from_cli;
    }

    args.iter()
        .position(|a| a == "--config" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .and_then(|config_path| std::fs::read_to_string(config_path).ok())
        .and_then(|content| log_level_from_toml(&content))
}

fn log_level_from_toml(content: &str) -> Option<LogLevel> {
    toml::from_str::<toml::Value>(content)
        .ok()
        .and_then(|v| v.get("log")?.get("level")?.as_str().map(|s| s.to_string()))
        .and_then(|s| LogLevel::parse(&s))
}

/// 初始化日志；已经存在全局 subscriber 时不会失败
pub fn init_logger(log_level: Option<LogLevel>) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        let level = log_level.unwrap_or_default();
        EnvFilter::new(format!("raygate={}", level.as_str()))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .try_init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// 记录连接事件
    pub fn connection(addr: &str, event: &str) {
        debug!(peer = addr, event = event, "Connection");
    }

    /// 记录协议握手事件
    pub fn protocol(event: &str, error: Option<&str>) {
        if let Some(err) = error {
            warn!(event = event, error = err, "Protocol");
        } else {
            debug!(event = event, "Protocol");
        }
    }

    /// 记录出站分发事件
    pub fn dispatch(destination: &str, outbound: &str) {
        info!(destination = destination, outbound = outbound, "Dispatching");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_from_cli_wins() {
        let args: Vec<String> = ["raygate", "--log-level", "trace", "-c", "/nonexistent"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(log_level_from(&args), Some(LogLevel::Trace));
    }

    #[test]
    fn test_log_level_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[log]\nlevel = \"error\"\n").unwrap();

        let args = vec![
            "raygate".to_string(),
            "--config".to_string(),
            path.to_string_lossy().to_string(),
        ];
        assert_eq!(log_level_from(&args), Some(LogLevel::Error));
    }

    #[test]
    fn test_log_level_missing() {
        assert_eq!(log_level_from_toml("port = 1"), None);
        assert_eq!(log_level_from(&["raygate".to_string()]), None);
    }

    #[test]
    fn test_init_logger_twice_is_not_fatal() {
        init_logger(Some(LogLevel::Debug));
        init_logger(None);
        log::protocol("handshake", None);
    }
}
