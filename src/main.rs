//! raygate binary: loads one point from a TOML file and runs it until a
//! shutdown signal arrives.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use raygate::config::{CliArgs, ConnConfig, FileConfig};
use raygate::core::{Point, Registry};
use raygate::logger::{self, log, LogLevel};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();

    // CLI/env level first, then the config file's [log] level
    let log_level = cli
        .log_level
        .as_deref()
        .and_then(LogLevel::parse)
        .or_else(logger::get_log_level_from_args);
    logger::init_logger(log_level);

    cli.validate()?;
    let file_config = FileConfig::load(&cli.config)?;
    let conn_config = ConnConfig::from_cli(&cli);

    log::info!(
        config = %cli.config.display(),
        inbound = %file_config.point.inbound.protocol,
        outbound = %file_config.point.outbound.protocol,
        "Starting gateway"
    );

    let registry = Registry::with_builtins()?;
    let point = Point::new(&file_config.point, &registry, conn_config)?;

    let cancel_token = CancellationToken::new();
    let running = point.start(cancel_token.clone()).await?;
    log::info!(address = %running.local_addr(), "Listening");

    // Setup shutdown handler
    let cancel_token_clone = cancel_token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        cancel_token_clone.cancel();
    });

    running.wait().await;
    log::info!("Gateway stopped");
    Ok(())
}
