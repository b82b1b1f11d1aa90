//! Configuration Management Module
//!
//! Loads and validates the JSON configuration files of the control plane
//! (`convoy-server`) and the execution host (`convoy-agent`).

pub mod types;

use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;

pub use types::{
    AgentBinding, AgentConfig, ControlPlaneConfig, ExecutorSettings, ReconnectConfig,
    CONFIG_VERSION,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Credential environment variable '{0}' is not set")]
    MissingCredential(String),

    #[error("Version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Load and validate the control plane configuration.
pub fn load_control_plane(path: &Path) -> Result<ControlPlaneConfig, ConfigError> {
    let config: ControlPlaneConfig = load_json(path)?;
    config.validate()?;
    Ok(config)
}

/// Load and validate the agent configuration.
pub fn load_agent(path: &Path) -> Result<AgentConfig, ConfigError> {
    let config: AgentConfig = load_json(path)?;
    config.validate()?;
    Ok(config)
}
