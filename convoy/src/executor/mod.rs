//! Deployment Executor
//!
//! Runs one DEPLOY at a time through a forward-only sequence:
//!
//! 1. RECEIVED: validate the payload (no side effects)
//! 2. MATERIALIZING: resolve secret scopes, write the overlay
//! 3. EXECUTING: converge with the overlay, stream output as LOG_CHUNK
//! 4. VERIFYING: poll until every target runs, bounded
//! 5. REPORTING: one terminal STATUS
//! 6. CLEANED_UP
//!
//! The overlay and the resolved secrets are held by a finalizer that runs on
//! every path, including a dropped task, and always before STATUS goes out.

pub mod job;
mod overlay;
mod runner;
#[cfg(test)]
pub(crate) mod testing;
mod verify;

pub use job::{abort_pair, AbortHandle, AbortSignal, DeploymentJob, ExitSignal, JobStep, StepError};
pub use overlay::{declared_services, overlay_path, OverlayArtifact, OverlayError};
pub use runner::{
    parse_ps_output, ComposeInvocation, ComposeRunner, DockerComposeRunner, OutputLine,
    RunnerError, ServiceState,
};
pub use verify::VerifyPolicy;

use std::collections::BTreeSet;
use std::path::{Component, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ExecutorSettings;
use crate::protocol::{DeployPayload, LogChunkPayload, LogStream, OverlayHints, StatusPayload};
use crate::secrets::{self, Redactor, ScopedEnvironment};

/// Service definition looked up when the DEPLOY names none.
pub const DEFAULT_DEFINITION: &str = "docker-compose.yml";

/// Output lines buffered between the runner and the uplink.
const LOG_BUFFER: usize = 256;

const MAX_JOB_ID_LEN: usize = 128;

/// Why a job ended FAILED. `Display` is the STATUS detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("materialization failed: {0}")]
    Materialize(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("verification timeout: {0}")]
    VerificationTimeout(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("terminated")]
    Terminated,

    #[error("busy")]
    Busy,
}

impl JobFailure {
    /// Mask secret values in the detail text.
    fn redacted(self, redactor: &Redactor) -> Self {
        let mask = |s: String| redactor.redact(&s).into_owned();
        match self {
            JobFailure::InvalidPayload(s) => JobFailure::InvalidPayload(mask(s)),
            JobFailure::Materialize(s) => JobFailure::Materialize(mask(s)),
            JobFailure::Execution(s) => JobFailure::Execution(mask(s)),
            JobFailure::VerificationTimeout(s) => JobFailure::VerificationTimeout(mask(s)),
            JobFailure::Verification(s) => JobFailure::Verification(mask(s)),
            other => other,
        }
    }
}

/// Where a job's LOG_CHUNK and STATUS events go.
#[async_trait]
pub trait JobEvents: Send + Sync {
    /// Best effort, never blocks.
    fn log(&self, correlation_id: &str, chunk: LogChunkPayload);

    /// Waits at most `timeout`. Returns whether the event was handed off.
    async fn status(&self, correlation_id: &str, status: StatusPayload, timeout: Duration) -> bool;
}

/// Runtime knobs of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub working_dir: PathBuf,
    pub overlay_dir: PathBuf,
    pub execution_timeout: Duration,
    pub verify: VerifyPolicy,
    pub status_send_timeout: Duration,
}

impl ExecutorOptions {
    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self {
            working_dir: settings.working_dir.clone(),
            overlay_dir: settings.overlay_dir.clone(),
            execution_timeout: Duration::from_secs(settings.execution_timeout_secs),
            verify: VerifyPolicy {
                settle: Duration::from_secs(settings.verify_settle_secs),
                poll_interval: Duration::from_secs(settings.verify_poll_interval_secs),
                timeout: Duration::from_secs(settings.verify_timeout_secs),
            },
            status_send_timeout: Duration::from_secs(settings.status_send_timeout_secs),
        }
    }
}

/// Result of offering a DEPLOY to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    /// Another job is in flight; a BUSY status was sent for this one.
    Busy,
}

struct ActiveJob {
    generation: u64,
    job_id: String,
    abort: AbortHandle,
}

pub struct DeploymentExecutor {
    options: ExecutorOptions,
    runner: Arc<dyn ComposeRunner>,
    events: Arc<dyn JobEvents>,
    active: Mutex<Option<ActiveJob>>,
    generation: AtomicU64,
    idle: watch::Sender<bool>,
}

impl DeploymentExecutor {
    /// Executor over `options`. Overlays left in the overlay directory by a
    /// previous process are removed first.
    pub fn new(
        options: ExecutorOptions,
        runner: Arc<dyn ComposeRunner>,
        events: Arc<dyn JobEvents>,
    ) -> Arc<Self> {
        let stale = overlay::sweep_leftovers(&options.overlay_dir);
        if stale > 0 {
            info!("[executor] Removed {} stale overlay(s)", stale);
        }

        let (idle, _) = watch::channel(true);
        Arc::new(Self {
            options,
            runner,
            events,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            idle,
        })
    }

    /// Start a job, or reject it with BUSY while another one runs.
    pub fn handle_deploy(self: &Arc<Self>, correlation_id: String, payload: DeployPayload) -> Admission {
        let Some((generation, signal)) = self.admit(&payload.job_id) else {
            self.report_busy(correlation_id, payload.job_id);
            return Admission::Busy;
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.run_job(correlation_id, payload, signal, generation)
                .await;
        });
        Admission::Started
    }

    /// Claim the single job slot for `job_id`.
    fn admit(&self, job_id: &str) -> Option<(u64, AbortSignal)> {
        let mut active = self.active.lock();
        if let Some(running) = active.as_ref() {
            warn!(
                "[executor] Rejecting job {}: job {} in flight",
                job_id, running.job_id
            );
            return None;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (handle, signal) = abort_pair();
        *active = Some(ActiveJob {
            generation,
            job_id: job_id.to_string(),
            abort: handle,
        });
        self.idle.send_replace(false);
        Some((generation, signal))
    }

    /// Abort the in-flight job. Returns `false` when there is none.
    pub fn terminate(&self, grace: Duration) -> bool {
        match self.active.lock().as_ref() {
            Some(running) => {
                info!(
                    "[executor] Terminating job {} (grace {:?})",
                    running.job_id, grace
                );
                running.abort.abort(grace);
                true
            }
            None => {
                debug!("[executor] Terminate with no job in flight");
                false
            }
        }
    }

    /// Job id of the in-flight job.
    pub fn current_job(&self) -> Option<String> {
        self.active.lock().as_ref().map(|j| j.job_id.clone())
    }

    pub fn is_idle(&self) -> bool {
        *self.idle.borrow()
    }

    /// Wait until no job holds the slot.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    fn release_slot(&self, generation: u64) {
        let mut active = self.active.lock();
        if active.as_ref().map(|j| j.generation) == Some(generation) {
            *active = None;
            self.idle.send_replace(true);
        }
    }

    fn report_busy(&self, correlation_id: String, job_id: String) {
        let events = self.events.clone();
        let timeout = self.options.status_send_timeout;
        tokio::spawn(async move {
            let status = StatusPayload::failed(job_id, JobFailure::Busy.to_string());
            if !events.status(&correlation_id, status, timeout).await {
                warn!("[executor] BUSY status for {} not delivered", correlation_id);
            }
        });
    }

    fn system_log(&self, job: &DeploymentJob, line: impl Into<String>) {
        self.events.log(
            job.correlation_id(),
            LogChunkPayload {
                job_id: job.job_id().to_string(),
                stream: LogStream::System,
                line: line.into(),
                ts: Utc::now(),
            },
        );
    }

    async fn run_job(
        self: Arc<Self>,
        correlation_id: String,
        payload: DeployPayload,
        abort: AbortSignal,
        generation: u64,
    ) {
        let mut job = DeploymentJob::new(correlation_id, payload.job_id.clone());
        let mut finalizer = Finalizer::new(self.clone(), generation, payload.job_id.clone());
        info!(
            "[executor] Job {} received (targets {:?}, {} secret(s))",
            job.job_id(),
            payload.target_services,
            payload.secrets.len()
        );

        let outcome = self.execute(&mut job, payload, abort, &mut finalizer).await;

        // Step 5: REPORTING
        let _ = job.advance(JobStep::Reporting);
        finalizer.release();

        let status = match &outcome {
            Ok(()) => {
                info!("[executor] Job {} succeeded", job.job_id());
                self.system_log(&job, "deployment succeeded");
                StatusPayload::success(job.job_id())
            }
            Err(failure) => {
                warn!("[executor] Job {} failed: {}", job.job_id(), failure);
                self.system_log(&job, format!("deployment failed: {}", failure));
                StatusPayload::failed(job.job_id(), failure.to_string())
            }
        };
        if !self
            .events
            .status(job.correlation_id(), status, self.options.status_send_timeout)
            .await
        {
            warn!("[executor] STATUS for job {} not delivered", job.job_id());
        }

        // Step 6: CLEANED_UP
        let _ = job.advance(JobStep::CleanedUp);
        debug!(
            "[executor] Job {} done in {}ms",
            job.job_id(),
            (Utc::now() - job.created_at()).num_milliseconds()
        );
    }

    async fn execute(
        &self,
        job: &mut DeploymentJob,
        mut payload: DeployPayload,
        abort: AbortSignal,
        finalizer: &mut Finalizer,
    ) -> Result<(), JobFailure> {
        // Step 1: RECEIVED
        validate_payload(&payload)?;
        if abort.requested().is_some() {
            return Err(JobFailure::Terminated);
        }
        let targets = std::mem::take(&mut payload.target_services);

        // Step 2: MATERIALIZING
        let _ = job.advance(JobStep::Materializing);
        let (project_dir, definition) = self.project_paths(&payload.overlay_hints);
        let declared = declared_services(&definition)
            .map_err(|e| JobFailure::Materialize(e.to_string()))?;
        check_targets_declared(&targets, &declared, &definition)?;

        let env = secrets::resolve(&payload.secrets, &declared);
        payload.secrets.clear();
        let redactor = Redactor::new(env.values());

        let overlay = OverlayArtifact::write(
            &self.options.overlay_dir,
            job.job_id(),
            &definition,
            &env,
            &targets,
        )
        .map_err(|e| JobFailure::Materialize(e.to_string()))?;

        let invocation = ComposeInvocation {
            project_dir,
            definition,
            overlay: overlay.path().to_path_buf(),
            project_name: payload.overlay_hints.project_name.clone(),
            services: targets.clone(),
        };
        finalizer.hold(overlay, env);
        self.system_log(job, format!("overlay materialized for {:?}", targets));
        if abort.requested().is_some() {
            return Err(JobFailure::Terminated);
        }

        // Step 3: EXECUTING
        let _ = job.advance(JobStep::Executing);
        let exit = self
            .converge(job, &invocation, &redactor, abort.clone())
            .await
            .map_err(|f| f.redacted(&redactor))?;
        job.record_exit(exit);
        match exit {
            ExitSignal::Exited(0) => {}
            ExitSignal::Exited(code) => {
                return Err(JobFailure::Execution(format!("exit code {}", code)))
            }
            ExitSignal::Signalled => {
                return Err(JobFailure::Execution("killed by signal".to_string()))
            }
            ExitSignal::Terminated => return Err(JobFailure::Terminated),
        }
        if abort.requested().is_some() {
            return Err(JobFailure::Terminated);
        }

        // Step 4: VERIFYING
        let _ = job.advance(JobStep::Verifying);
        self.system_log(job, "verifying services");
        verify::wait_until_running(
            self.runner.as_ref(),
            &invocation,
            &targets,
            &self.options.verify,
            abort,
        )
        .await
        .map_err(|f| f.redacted(&redactor))
    }

    /// Run the convergence and forward its output until it ends.
    async fn converge(
        &self,
        job: &DeploymentJob,
        invocation: &ComposeInvocation,
        redactor: &Redactor,
        abort: AbortSignal,
    ) -> Result<ExitSignal, JobFailure> {
        let (tx, mut rx) = mpsc::channel(LOG_BUFFER);
        let timeout = self.options.execution_timeout;
        let converge = tokio::time::timeout(timeout, self.runner.converge(invocation, tx, abort));
        tokio::pin!(converge);

        let forward = |line: OutputLine| {
            self.events.log(
                job.correlation_id(),
                LogChunkPayload {
                    job_id: job.job_id().to_string(),
                    stream: line.stream,
                    line: redactor.redact(&line.line).into_owned(),
                    ts: Utc::now(),
                },
            );
        };

        let result = loop {
            tokio::select! {
                r = &mut converge => break r,
                Some(line) = rx.recv() => forward(line),
            }
        };
        while let Ok(line) = rx.try_recv() {
            forward(line);
        }

        match result {
            Ok(Ok(exit)) => Ok(exit),
            Ok(Err(e)) => Err(JobFailure::Execution(e.to_string())),
            Err(_) => Err(JobFailure::Execution(format!("timed out after {:?}", timeout))),
        }
    }

    /// Project directory and service definition for a job.
    fn project_paths(&self, hints: &OverlayHints) -> (PathBuf, PathBuf) {
        let project_dir = match &hints.working_dir {
            Some(dir) => self.options.working_dir.join(dir),
            None => self.options.working_dir.clone(),
        };
        let definition =
            project_dir.join(hints.compose_file.as_deref().unwrap_or(DEFAULT_DEFINITION));
        (project_dir, definition)
    }
}

/// Owns everything a job must release: the overlay, the resolved secrets and
/// the executor slot. Runs on `release()` or, failing that, on drop.
struct Finalizer {
    executor: Arc<DeploymentExecutor>,
    generation: u64,
    job_id: String,
    overlay: Option<OverlayArtifact>,
    env: Option<ScopedEnvironment>,
    released: bool,
}

impl Finalizer {
    fn new(executor: Arc<DeploymentExecutor>, generation: u64, job_id: String) -> Self {
        Self {
            executor,
            generation,
            job_id,
            overlay: None,
            env: None,
            released: false,
        }
    }

    fn hold(&mut self, overlay: OverlayArtifact, env: ScopedEnvironment) {
        self.overlay = Some(overlay);
        self.env = Some(env);
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(mut overlay) = self.overlay.take() {
            if let Err(e) = overlay.remove() {
                error!(
                    "[executor] Job {}: overlay {} not removed: {}",
                    self.job_id,
                    overlay.path().display(),
                    e
                );
            }
        }
        if let Some(mut env) = self.env.take() {
            env.scrub();
        }
        self.executor.release_slot(self.generation);
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if !self.released {
            warn!("[executor] Job {} aborted before reporting", self.job_id);
            self.release();
        }
    }
}

fn validate_payload(payload: &DeployPayload) -> Result<(), JobFailure> {
    let id = &payload.job_id;
    if id.is_empty() || id.len() > MAX_JOB_ID_LEN {
        return Err(JobFailure::InvalidPayload(
            "job_id must be 1-128 characters".into(),
        ));
    }
    if id.starts_with('.')
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(JobFailure::InvalidPayload(format!(
            "job_id '{}' has invalid characters",
            id
        )));
    }

    if payload.target_services.is_empty() {
        return Err(JobFailure::InvalidPayload(
            "target_services is empty".into(),
        ));
    }
    let mut seen = BTreeSet::new();
    for target in &payload.target_services {
        if target.trim().is_empty() {
            return Err(JobFailure::InvalidPayload("empty target service".into()));
        }
        if !seen.insert(target) {
            return Err(JobFailure::InvalidPayload(format!(
                "duplicate target service '{}'",
                target
            )));
        }
    }

    if matches!(payload.overlay_hints.project_name.as_deref(), Some("")) {
        return Err(JobFailure::InvalidPayload("empty project_name".into()));
    }
    if let Some(dir) = &payload.overlay_hints.working_dir {
        check_contained("working_dir", dir)?;
    }
    if let Some(file) = &payload.overlay_hints.compose_file {
        check_contained("compose_file", file)?;
    }

    secrets::validate(&payload.secrets).map_err(|e| JobFailure::InvalidPayload(e.to_string()))
}

/// Path hints stay inside the configured working directory: relative, no
/// `..`, not empty.
fn check_contained(field: &str, hint: &str) -> Result<(), JobFailure> {
    let path = std::path::Path::new(hint);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if hint.is_empty() || path.is_absolute() || escapes {
        return Err(JobFailure::InvalidPayload(format!(
            "{} '{}' must be a relative path inside the working directory",
            field, hint
        )));
    }
    Ok(())
}

fn check_targets_declared(
    targets: &[String],
    declared: &BTreeSet<String>,
    definition: &std::path::Path,
) -> Result<(), JobFailure> {
    match targets.iter().find(|t| !declared.contains(*t)) {
        Some(missing) => Err(JobFailure::Materialize(format!(
            "service '{}' is not declared in {}",
            missing,
            definition.display()
        ))),
        None => Ok(()),
    }
}
