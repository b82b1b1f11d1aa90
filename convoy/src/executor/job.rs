//! Deployment job: step cursor, exit signal and abort signalling.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

/// Forward-only progress of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobStep {
    Received,
    Materializing,
    Executing,
    Verifying,
    Reporting,
    CleanedUp,
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStep::Received => "RECEIVED",
            JobStep::Materializing => "MATERIALIZING",
            JobStep::Executing => "EXECUTING",
            JobStep::Verifying => "VERIFYING",
            JobStep::Reporting => "REPORTING",
            JobStep::CleanedUp => "CLEANED_UP",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid step transition: {from} -> {to}")]
pub struct StepError {
    pub from: JobStep,
    pub to: JobStep,
}

/// How the convergence process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal outside our control.
    Signalled,
    /// Stopped because the job was terminated.
    Terminated,
}

impl ExitSignal {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitSignal::Exited(code),
            None => ExitSignal::Signalled,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitSignal::Exited(0))
    }
}

/// Host-local record of one deployment. Never persisted.
#[derive(Debug)]
pub struct DeploymentJob {
    correlation_id: String,
    job_id: String,
    step: JobStep,
    exit: Option<ExitSignal>,
    created_at: DateTime<Utc>,
    history: Vec<(JobStep, DateTime<Utc>)>,
}

impl DeploymentJob {
    pub fn new(correlation_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.into(),
            job_id: job_id.into(),
            step: JobStep::Received,
            exit: None,
            created_at: now,
            history: vec![(JobStep::Received, now)],
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn step(&self) -> JobStep {
        self.step
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Steps entered so far with their timestamps.
    pub fn history(&self) -> &[(JobStep, DateTime<Utc>)] {
        &self.history
    }

    /// Move the cursor strictly forward. Steps may be skipped.
    pub fn advance(&mut self, next: JobStep) -> Result<(), StepError> {
        if next <= self.step {
            return Err(StepError {
                from: self.step,
                to: next,
            });
        }
        debug!("[executor] job {} {} -> {}", self.job_id, self.step, next);
        self.step = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }

    pub fn record_exit(&mut self, exit: ExitSignal) {
        self.exit = Some(exit);
    }

    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.exit
    }
}

/// Requests an abort of the running job with a grace period.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<Duration>>>,
}

/// Observes abort requests. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<Duration>>,
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(None);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortHandle {
    /// First request wins; later calls keep the original grace period.
    pub fn abort(&self, grace: Duration) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(grace);
                true
            }
        })
    }
}

impl AbortSignal {
    /// Grace period if an abort was requested.
    pub fn requested(&self) -> Option<Duration> {
        *self.rx.borrow()
    }

    /// Resolve with the grace period once an abort is requested. Pending
    /// forever if the handle is dropped without aborting.
    pub async fn aborted(&mut self) -> Duration {
        loop {
            if let Some(grace) = *self.rx.borrow_and_update() {
                return grace;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
