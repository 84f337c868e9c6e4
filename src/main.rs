//! tse-commander gateway binary
//!
//! Loads the configuration, starts one command queue per device and serves
//! client sessions until Ctrl-C.
//!
//! ```text
//! tse-commander --config config/gateway.toml --port 8023
//! telnet localhost 8023
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tse_commander::config::DEFAULT_CONFIG_PATH;
use tse_commander::{DeviceRegistry, Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "tse-commander", version, about = "Interactive command gateway for test instruments")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen address, overrides `server.bind`
    #[arg(long)]
    bind: Option<String>,

    /// Listen port, overrides `server.port`
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level, overrides `application.log_level`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config.validate()?;

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config = %cli.config.display(), "Starting tse-commander");

    let registry = Arc::new(DeviceRegistry::from_config(&config)?);
    let gateway = Gateway::new(registry.clone(), config.server.clone());
    let listener = gateway
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.bind, config.server.port))?;

    gateway
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    registry.shutdown().await?;
    info!("Gateway stopped");
    Ok(())
}
