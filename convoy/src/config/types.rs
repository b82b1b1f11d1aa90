//! Configuration Types
//!
//! JSON configuration for both binaries, with per-field defaults and a
//! version number for migrations.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::protocol::Direction;
use crate::secrets::REDACTED;
use crate::session::SessionConfig;

/// Current configuration version
pub const CONFIG_VERSION: u32 = 1;

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_listen_addr() -> String {
    "0.0.0.0:7443".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_miss_factor() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    256
}

/// Identity bound to a credential digest by provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinding {
    pub identity: String,
    /// Lowercase hex SHA-256 of the bearer credential
    pub credential_sha256: String,
}

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Seconds a new connection has to send HELLO
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Host heartbeat interval the liveness window is derived from
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Missed intervals before a silent session is torn down
    #[serde(default = "default_miss_factor")]
    pub heartbeat_miss_factor: u32,

    /// Outbound queue capacity per session
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Provisioned agents
    #[serde(default)]
    pub agents: Vec<AgentBinding>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            listen_addr: default_listen_addr(),
            handshake_timeout_secs: default_handshake_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_miss_factor: default_miss_factor(),
            outbound_queue_capacity: default_queue_capacity(),
            agents: Vec::new(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_version(self.version)?;
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_secs must be > 0".into()));
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_miss_factor == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs and heartbeat_miss_factor must be > 0".into(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid("outbound_queue_capacity must be > 0".into()));
        }
        for binding in &self.agents {
            if binding.identity.is_empty() {
                return Err(ConfigError::Invalid("agent identity must not be empty".into()));
            }
            if binding.credential_sha256.len() != 64
                || !binding.credential_sha256.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(ConfigError::Invalid(format!(
                    "credential_sha256 for '{}' is not a SHA-256 hex digest",
                    binding.identity
                )));
            }
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Session parameters for accepted agents.
    pub fn session_config(&self) -> SessionConfig {
        let mut cfg = SessionConfig::new(
            Duration::from_secs(self.heartbeat_interval_secs),
            Direction::Upstream,
        );
        cfg.heartbeat_miss_factor = self.heartbeat_miss_factor;
        cfg.outbound_capacity = self.outbound_queue_capacity;
        cfg
    }

    /// Identity → digest table for the authenticator.
    pub fn credential_digests(&self) -> HashMap<String, String> {
        self.agents
            .iter()
            .map(|b| (b.identity.clone(), b.credential_sha256.clone()))
            .collect()
    }
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

/// Reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Fraction of the delay added or removed at random (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter_ratio: default_jitter(),
        }
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_overlay_dir() -> PathBuf {
    std::env::temp_dir().join("convoy")
}

fn default_execution_timeout() -> u64 {
    900
}

fn default_verify_settle() -> u64 {
    3
}

fn default_verify_poll() -> u64 {
    2
}

fn default_verify_timeout() -> u64 {
    60
}

fn default_status_timeout() -> u64 {
    5
}

fn default_compose_program() -> String {
    "docker".to_string()
}

/// Deployment executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Directory holding the user's service definition
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Where overlay artifacts are written (never the user's directory)
    #[serde(default = "default_overlay_dir")]
    pub overlay_dir: PathBuf,

    /// Program providing `compose` (docker or podman)
    #[serde(default = "default_compose_program")]
    pub compose_program: String,

    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    #[serde(default = "default_verify_settle")]
    pub verify_settle_secs: u64,

    #[serde(default = "default_verify_poll")]
    pub verify_poll_interval_secs: u64,

    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    /// Upper bound for handing the terminal STATUS to the session
    #[serde(default = "default_status_timeout")]
    pub status_send_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            overlay_dir: default_overlay_dir(),
            compose_program: default_compose_program(),
            execution_timeout_secs: default_execution_timeout(),
            verify_settle_secs: default_verify_settle(),
            verify_poll_interval_secs: default_verify_poll(),
            verify_timeout_secs: default_verify_timeout(),
            status_send_timeout_secs: default_status_timeout(),
        }
    }
}

/// Execution host configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    pub identity: String,

    /// Bearer credential. Prefer `credential_env` outside of development.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,

    /// e.g. `wss://control.example.com/agent`
    pub control_plane_url: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_miss_factor")]
    pub heartbeat_miss_factor: u32,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub executor: ExecutorSettings,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("version", &self.version)
            .field("identity", &self.identity)
            .field("credential", &self.credential.as_ref().map(|_| REDACTED))
            .field("credential_env", &self.credential_env)
            .field("control_plane_url", &self.control_plane_url)
            .field("capabilities", &self.capabilities)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("heartbeat_miss_factor", &self.heartbeat_miss_factor)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("reconnect", &self.reconnect)
            .field("executor", &self.executor)
            .finish()
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_version(self.version)?;
        if self.identity.is_empty() {
            return Err(ConfigError::Invalid("identity must not be empty".into()));
        }
        if !(self.control_plane_url.starts_with("ws://")
            || self.control_plane_url.starts_with("wss://"))
        {
            return Err(ConfigError::Invalid(
                "control_plane_url must be a ws:// or wss:// URL".into(),
            ));
        }
        if self.credential.is_none() && self.credential_env.is_none() {
            return Err(ConfigError::Invalid(
                "one of credential or credential_env is required".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_miss_factor == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs and heartbeat_miss_factor must be > 0".into(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_secs must be > 0".into()));
        }
        if self.reconnect.base_delay_ms == 0 || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            return Err(ConfigError::Invalid("jitter_ratio must be within 0.0..=1.0".into()));
        }
        if self.executor.verify_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("verify_poll_interval_secs must be > 0".into()));
        }
        Ok(())
    }

    /// Resolve the bearer credential from the file or the environment.
    pub fn resolve_credential(&self) -> Result<String, ConfigError> {
        if let Some(var) = &self.credential_env {
            return std::env::var(var).map_err(|_| ConfigError::MissingCredential(var.clone()));
        }
        self.credential
            .clone()
            .ok_or_else(|| ConfigError::Invalid("credential not configured".into()))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Session parameters for the outbound session.
    pub fn session_config(&self) -> SessionConfig {
        let mut cfg = SessionConfig::new(self.heartbeat_interval(), Direction::Downstream);
        cfg.heartbeat_miss_factor = self.heartbeat_miss_factor;
        cfg.outbound_capacity = self.outbound_queue_capacity;
        cfg
    }
}

fn check_version(found: u32) -> Result<(), ConfigError> {
    if found > CONFIG_VERSION {
        return Err(ConfigError::VersionMismatch {
            found,
            expected: CONFIG_VERSION,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_defaults() {
        let cfg: ControlPlaneConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(
            cfg.session_config().liveness_timeout(),
            Duration::from_secs(90)
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn test_agent_config_minimal() {
        let cfg: AgentConfig = serde_json::from_str(
            r#"{"identity":"agent_1","credential":"tok_abc","control_plane_url":"ws://127.0.0.1:7443"}"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.resolve_credential().unwrap(), "tok_abc");
        assert_eq!(cfg.reconnect.max_delay_ms, 60_000);
        assert_eq!(cfg.executor.verify_timeout_secs, 60);
        assert_eq!(cfg.session_config().inbound_direction, Direction::Downstream);
    }

    #[test]
    fn test_agent_config_rejects_bad_values() {
        let mut cfg: AgentConfig = serde_json::from_str(
            r#"{"identity":"a","credential":"t","control_plane_url":"http://x"}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());

        cfg.control_plane_url = "wss://x".into();
        cfg.reconnect.jitter_ratio = 1.5;
        assert!(cfg.validate().is_err());

        cfg.reconnect.jitter_ratio = 0.1;
        cfg.version = CONFIG_VERSION + 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_agent_config_rejects_zero_handshake_timeout() {
        let mut cfg: AgentConfig = serde_json::from_str(
            r#"{"identity":"a","credential":"t","control_plane_url":"ws://x"}"#,
        )
        .unwrap();
        cfg.validate().unwrap();

        cfg.handshake_timeout_secs = 0;
        match cfg.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("handshake_timeout_secs")),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_config_debug_hides_credential() {
        let cfg: AgentConfig = serde_json::from_str(
            r#"{"identity":"agent_1","credential":"tok_s3cret","control_plane_url":"ws://x"}"#,
        )
        .unwrap();
        let shown = format!("{:?}", cfg);
        assert!(!shown.contains("tok_s3cret"));
        assert!(shown.contains("agent_1"));
    }

    #[test]
    fn test_agent_binding_digest_checked() {
        let mut cfg = ControlPlaneConfig::default();
        cfg.agents.push(AgentBinding {
            identity: "agent_1".into(),
            credential_sha256: "not-a-digest".into(),
        });
        assert!(cfg.validate().is_err());

        cfg.agents[0].credential_sha256 = crate::auth::credential_digest("tok_abc");
        cfg.validate().unwrap();
        assert_eq!(cfg.credential_digests().len(), 1);
    }
}
