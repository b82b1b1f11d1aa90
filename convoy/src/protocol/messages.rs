//! Payload types for every envelope type.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::secrets::{SecretEntry, REDACTED};

// ═══════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════

/// HELLO: first message on every connection, sent by the host.
#[derive(Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub identity: String,
    pub credential: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl fmt::Debug for HelloPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloPayload")
            .field("identity", &self.identity)
            .field("credential", &REDACTED)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// DEPLOY: run one deployment job on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployPayload {
    pub job_id: String,
    pub target_services: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<SecretEntry>,
    #[serde(default)]
    pub overlay_hints: OverlayHints,
}

/// Where the host finds the user's service definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayHints {
    /// Path of the user's compose file, relative to the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    /// Overrides the agent's configured working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// TERMINATE: abort the in-flight job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminatePayload {
    #[serde(default)]
    pub grace_period_seconds: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════

/// HELLO_ACK: handshake verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckPayload {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HelloAckPayload {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines produced by the executor itself (step transitions).
    System,
}

/// LOG_CHUNK: one line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunkPayload {
    pub job_id: String,
    pub stream: LogStream,
    pub line: String,
    pub ts: DateTime<Utc>,
}

/// Terminal job state reported in STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Success,
    Failed,
}

/// STATUS: exactly one per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub job_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusPayload {
    pub fn success(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Success,
            detail: None,
        }
    }

    pub fn failed(job_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Failed,
            detail: Some(detail.into()),
        }
    }
}
