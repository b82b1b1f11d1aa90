//! Scripted runner and recording event sink for executor tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::job::{AbortSignal, ExitSignal};
use super::runner::{ComposeInvocation, ComposeRunner, OutputLine, RunnerError, ServiceState};
use super::JobEvents;
use crate::protocol::{LogChunkPayload, StatusPayload};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Converge {
    Exit(ExitSignal),
    /// Runs until aborted, then reports `Terminated`.
    UntilAborted,
    /// Ignores aborts; only the execution timeout ends it.
    Forever,
}

pub(crate) struct ScriptedRunner {
    lines: Vec<OutputLine>,
    converge: Converge,
    states: Mutex<VecDeque<Vec<ServiceState>>>,
    pub converge_calls: AtomicUsize,
    pub overlay_seen: Mutex<Option<String>>,
    pub started: Notify,
}

impl ScriptedRunner {
    pub fn new(converge: Converge) -> Self {
        Self {
            lines: Vec::new(),
            converge,
            states: Mutex::new(VecDeque::new()),
            converge_calls: AtomicUsize::new(0),
            overlay_seen: Mutex::new(None),
            started: Notify::new(),
        }
    }

    pub fn with_lines(mut self, lines: Vec<OutputLine>) -> Self {
        self.lines = lines;
        self
    }

    /// Successive `service_states` answers; the last one repeats.
    pub fn with_states(self, states: Vec<Vec<ServiceState>>) -> Self {
        *self.states.lock() = states.into();
        self
    }
}

#[async_trait]
impl ComposeRunner for ScriptedRunner {
    async fn converge(
        &self,
        invocation: &ComposeInvocation,
        output: mpsc::Sender<OutputLine>,
        mut abort: AbortSignal,
    ) -> Result<ExitSignal, RunnerError> {
        self.converge_calls.fetch_add(1, Ordering::SeqCst);
        *self.overlay_seen.lock() = std::fs::read_to_string(&invocation.overlay).ok();

        for line in &self.lines {
            let _ = output.send(line.clone()).await;
        }
        self.started.notify_one();

        match self.converge {
            Converge::Exit(exit) => Ok(exit),
            Converge::UntilAborted => {
                abort.aborted().await;
                Ok(ExitSignal::Terminated)
            }
            Converge::Forever => {
                std::future::pending::<()>().await;
                Ok(ExitSignal::Exited(0))
            }
        }
    }

    async fn service_states(
        &self,
        invocation: &ComposeInvocation,
    ) -> Result<Vec<ServiceState>, RunnerError> {
        let mut states = self.states.lock();
        let answer = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        Ok(answer.unwrap_or_else(|| {
            invocation
                .services
                .iter()
                .map(|s| ServiceState::new(s.clone(), "running"))
                .collect()
        }))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Recorded {
    Log {
        correlation_id: String,
        chunk: LogChunkPayload,
    },
    Status {
        correlation_id: String,
        status: StatusPayload,
    },
}

pub(crate) struct RecordingEvents {
    tx: mpsc::UnboundedSender<Recorded>,
}

impl RecordingEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Recorded>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobEvents for RecordingEvents {
    fn log(&self, correlation_id: &str, chunk: LogChunkPayload) {
        let _ = self.tx.send(Recorded::Log {
            correlation_id: correlation_id.to_string(),
            chunk,
        });
    }

    async fn status(&self, correlation_id: &str, status: StatusPayload, _timeout: Duration) -> bool {
        self.tx
            .send(Recorded::Status {
                correlation_id: correlation_id.to_string(),
                status,
            })
            .is_ok()
    }
}

/// Collect events until the STATUS for `job_id` arrives.
pub(crate) async fn until_status(
    rx: &mut mpsc::UnboundedReceiver<Recorded>,
    job_id: &str,
) -> (Vec<LogChunkPayload>, String, StatusPayload) {
    let mut logs = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for STATUS")
            .expect("event channel closed");
        match event {
            Recorded::Log { chunk, .. } => logs.push(chunk),
            Recorded::Status {
                correlation_id,
                status,
            } if status.job_id == job_id => return (logs, correlation_id, status),
            Recorded::Status { .. } => {}
        }
    }
}
