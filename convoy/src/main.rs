//! `convoy-server`: accepts host agent sessions and forwards their telemetry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use convoy_lib::config;
use convoy_lib::logging;
use convoy_lib::server::{ControlPlane, TracingSink};

/// Convoy control plane
#[derive(Parser)]
#[command(name = "convoy-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the control plane configuration file
    #[arg(short, long, env = "CONVOY_SERVER_CONFIG", value_name = "FILE")]
    config: PathBuf,

    /// Overrides `listen_addr` from the configuration file
    #[arg(long, env = "CONVOY_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONVOY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level).context("Failed to initialise logging")?;

    let mut config = config::load_control_plane(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("[server] {} agent(s) configured", config.agents.len());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("[server] Interrupt received, shutting down");
            }
            shutdown.cancel();
        });
    }

    let control_plane = ControlPlane::from_config(config, Arc::new(TracingSink));
    control_plane.serve(listener, shutdown).await?;
    Ok(())
}
