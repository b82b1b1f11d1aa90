//! Post-convergence verification.
//!
//! Waits `settle`, then polls service states every `poll_interval` until every
//! target is running or `timeout` elapses.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::job::AbortSignal;
use super::runner::{ComposeInvocation, ComposeRunner};
use super::JobFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub settle: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Sleep unless an abort arrives first.
async fn pause(duration: Duration, abort: &mut AbortSignal) -> Result<(), JobFailure> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = abort.aborted() => Err(JobFailure::Terminated),
    }
}

pub async fn wait_until_running(
    runner: &dyn ComposeRunner,
    invocation: &ComposeInvocation,
    targets: &[String],
    policy: &VerifyPolicy,
    mut abort: AbortSignal,
) -> Result<(), JobFailure> {
    let deadline = Instant::now() + policy.settle + policy.timeout;
    pause(policy.settle, &mut abort).await?;

    let mut pending: Vec<String> = targets.to_vec();
    let mut last_error: Option<String> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let poll = tokio::select! {
            r = tokio::time::timeout(remaining, runner.service_states(invocation)) => r,
            _ = abort.aborted() => return Err(JobFailure::Terminated),
        };

        match poll {
            Ok(Ok(states)) => {
                last_error = None;
                let mut still_pending = Vec::new();
                // A scaled service has one entry per replica; all must run.
                for target in targets {
                    let replicas: Vec<_> = states.iter().filter(|s| &s.service == target).collect();
                    if let Some(stopped) = replicas.iter().find(|s| s.is_stopped()) {
                        return Err(JobFailure::Verification(format!(
                            "{} is {}",
                            target, stopped.state
                        )));
                    }
                    if replicas.is_empty() || !replicas.iter().all(|s| s.is_running()) {
                        still_pending.push(target.clone());
                    }
                }
                if still_pending.is_empty() {
                    debug!("[executor] All targets running: {:?}", targets);
                    return Ok(());
                }
                pending = still_pending;
            }
            Ok(Err(e)) => last_error = Some(e.to_string()),
            Err(_) => {}
        }

        if Instant::now() + policy.poll_interval > deadline {
            let mut reason = format!(
                "{} not running after {:?}",
                pending.join(", "),
                policy.timeout
            );
            if let Some(e) = last_error {
                reason.push_str(&format!(" (last error: {})", e));
            }
            return Err(JobFailure::VerificationTimeout(reason));
        }
        pause(policy.poll_interval, &mut abort).await?;
    }
}
