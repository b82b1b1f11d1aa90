//! `convoy-agent`: keeps one session to the control plane and runs the
//! deployments it receives.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use convoy_lib::config;
use convoy_lib::host::HostAgent;
use convoy_lib::logging;

/// Convoy execution host agent
#[derive(Parser)]
#[command(name = "convoy-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the agent configuration file
    #[arg(short, long, env = "CONVOY_AGENT_CONFIG", value_name = "FILE")]
    config: PathBuf,

    /// Overrides `control_plane_url` from the configuration file
    #[arg(long, env = "CONVOY_CONTROL_PLANE_URL")]
    control_plane_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONVOY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level).context("Failed to initialise logging")?;

    let mut config = config::load_agent(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(url) = cli.control_plane_url {
        config.control_plane_url = url;
    }

    let agent = HostAgent::from_config(&config).context("Invalid agent configuration")?;
    info!(
        "[agent] {} connecting to {}",
        config.identity, config.control_plane_url
    );

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("[agent] Interrupt received, shutting down");
            }
            stop.cancel();
        });
    }

    agent.run(stop).await;
    Ok(())
}
