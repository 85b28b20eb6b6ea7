//! Coprocess daemon (coprocessd) - serves the `coprocess.Dispatcher` gRPC service.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use coprocess_core::config::ServerConfig;
use coprocess_core::shutdown::{ShutdownState, listen_for_ctrl_c};
use coprocess_core::{logging, server};

#[derive(Parser, Debug)]
#[command(name = "coprocessd", version, about = "Coprocess dispatcher server")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "COPROCESS_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address, overrides the configuration.
    #[arg(long)]
    addr: Option<String>,
    /// Log level used when RUST_LOG is unset; overrides the configuration.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref()).with_context(|| match &args.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config".to_string(),
    })?;
    if let Some(addr) = args.addr {
        config.listen_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    logging::init(&config.log_level);
    tracing::info!(target: "coprocess", addr = %config.listen_addr, "coprocessd starting");

    let shutdown = ShutdownState::new();
    listen_for_ctrl_c(shutdown.clone());
    server::serve(&config, shutdown)
        .await
        .context("dispatcher server failed")?;

    tracing::info!(target: "coprocess", "coprocessd stopped");
    Ok(())
}
