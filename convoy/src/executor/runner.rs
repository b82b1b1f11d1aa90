//! Convergence runner
//!
//! The external multi-service operation is `docker compose up -d` layered with
//! the job's overlay. [`ComposeRunner`] abstracts it so the executor can be
//! driven by a scripted fake in tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::job::{AbortSignal, ExitSignal};
use crate::protocol::LogStream;

/// Upper bound for `compose ps`.
const PS_TIMEOUT: Duration = Duration::from_secs(30);

/// Time output readers get to drain after the process is gone.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out after {1:?}")]
    TimedOut(String, Duration),

    #[error("{command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Unparseable service states: {0}")]
    Parse(String),
}

/// Files and services of one convergence.
#[derive(Debug, Clone)]
pub struct ComposeInvocation {
    pub project_dir: PathBuf,
    pub definition: PathBuf,
    pub overlay: PathBuf,
    pub project_name: Option<String>,
    pub services: Vec<String>,
}

impl ComposeInvocation {
    /// `-f <definition> -f <overlay> [-p <project>]`
    fn file_args(&self) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.definition.display().to_string(),
            "-f".to_string(),
            self.overlay.display().to_string(),
        ];
        if let Some(project) = &self.project_name {
            args.push("-p".to_string());
            args.push(project.clone());
        }
        args
    }
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: LogStream,
    pub line: String,
}

/// Reported state of one service container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub service: String,
    pub state: String,
    pub health: Option<String>,
}

impl ServiceState {
    pub fn new(service: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            state: state.into(),
            health: None,
        }
    }

    pub fn with_health(mut self, health: impl Into<String>) -> Self {
        self.health = Some(health.into());
        self
    }

    /// `running`, and healthy when a health check exists.
    pub fn is_running(&self) -> bool {
        self.state == "running"
            && match self.health.as_deref() {
                None | Some("") => true,
                Some(h) => h == "healthy",
            }
    }

    /// The container stopped and will not come back by itself.
    pub fn is_stopped(&self) -> bool {
        matches!(self.state.as_str(), "exited" | "dead")
    }
}

#[async_trait]
pub trait ComposeRunner: Send + Sync {
    /// Converge the services, streaming output into `output` in per-stream
    /// order. An abort request stops the process after its grace period.
    async fn converge(
        &self,
        invocation: &ComposeInvocation,
        output: mpsc::Sender<OutputLine>,
        abort: AbortSignal,
    ) -> Result<ExitSignal, RunnerError>;

    /// Current state of every service in the project.
    async fn service_states(
        &self,
        invocation: &ComposeInvocation,
    ) -> Result<Vec<ServiceState>, RunnerError>;
}

/// Runs `docker compose` (or any CLI with the same `compose` subcommand).
#[derive(Debug, Clone)]
pub struct DockerComposeRunner {
    program: String,
}

impl DockerComposeRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, invocation: &ComposeInvocation) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&invocation.project_dir)
            .args(invocation.file_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self, mut cmd: Command) -> Result<Child, RunnerError> {
        cmd.spawn().map_err(|e| RunnerError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })
    }
}

impl Default for DockerComposeRunner {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ComposeRunner for DockerComposeRunner {
    async fn converge(
        &self,
        invocation: &ComposeInvocation,
        output: mpsc::Sender<OutputLine>,
        mut abort: AbortSignal,
    ) -> Result<ExitSignal, RunnerError> {
        let mut cmd = self.command(invocation);
        cmd.args(["up", "-d"]).args(&invocation.services);
        debug!(
            "[executor] {} compose up -d {:?}",
            self.program, invocation.services
        );
        let mut child = self.spawn(cmd)?;

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, LogStream::Stdout, output.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, LogStream::Stderr, output.clone())));
        }
        drop(output);

        let exit = tokio::select! {
            status = child.wait() => ExitSignal::from_status(status?),
            grace = abort.aborted() => {
                stop_gracefully(&mut child, grace).await;
                ExitSignal::Terminated
            }
        };

        // Plugins can outlive the CLI and hold the pipes open.
        for mut pump in pumps {
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        Ok(exit)
    }

    async fn service_states(
        &self,
        invocation: &ComposeInvocation,
    ) -> Result<Vec<ServiceState>, RunnerError> {
        let mut cmd = self.command(invocation);
        cmd.args(["ps", "--all", "--format", "json"]);
        let child = self.spawn(cmd)?;

        let output = match tokio::time::timeout(PS_TIMEOUT, child.wait_with_output()).await {
            Ok(output) => output?,
            // Dropping the future kills the child.
            Err(_) => return Err(RunnerError::TimedOut("compose ps".into(), PS_TIMEOUT)),
        };

        if !output.status.success() {
            return Err(RunnerError::Failed {
                command: "compose ps".into(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_ps_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Forward lines of one stream. Invalid UTF-8 is replaced, never fatal.
async fn pump<R>(reader: R, stream: LogStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(OutputLine { stream, line }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("[executor] Reading {:?} failed: {}", stream, e);
                break;
            }
        }
    }
}

/// SIGTERM, wait out the grace period, then kill.
async fn stop_gracefully(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("[executor] Convergence stopped within grace period"),
        Err(_) => {
            warn!("[executor] Grace period {:?} elapsed, killing", grace);
            let _ = child.kill().await;
        }
    }
}

#[derive(Deserialize)]
struct PsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: Option<String>,
}

impl From<PsEntry> for ServiceState {
    fn from(e: PsEntry) -> Self {
        ServiceState {
            service: e.service,
            state: e.state.to_ascii_lowercase(),
            health: e.health.filter(|h| !h.is_empty()),
        }
    }
}

/// `compose ps --format json` prints either a JSON array or one object per
/// line, depending on the compose version.
pub fn parse_ps_output(stdout: &str) -> Result<Vec<ServiceState>, RunnerError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        let entries: Vec<PsEntry> =
            serde_json::from_str(trimmed).map_err(|e| RunnerError::Parse(e.to_string()))?;
        return Ok(entries.into_iter().map(ServiceState::from).collect());
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<PsEntry>(line)
                .map(ServiceState::from)
                .map_err(|e| RunnerError::Parse(e.to_string()))
        })
        .collect()
}
