//! Control plane and host agent over real TCP, with a scripted compose runner.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use convoy_lib::auth::StaticTokenAuthenticator;
use convoy_lib::config::{AgentConfig, ControlPlaneConfig};
use convoy_lib::dispatcher::{Command, SubmitOutcome};
use convoy_lib::executor::{
    AbortSignal, ComposeInvocation, ComposeRunner, ExitSignal, OutputLine, RunnerError,
    ServiceState,
};
use convoy_lib::host::HostAgent;
use convoy_lib::protocol::{
    self, DeployPayload, Envelope, JobState, LogStream, Message, OverlayHints, StatusPayload,
    TerminatePayload,
};
use convoy_lib::secrets::{Scope, SecretEntry};
use convoy_lib::server::{ChannelSink, ControlPlane, TelemetryEvent};

const COMPOSE: &str = "services:\n  backend:\n    image: shop/backend\n  db:\n    image: postgres\n";

/// Prints one line per target, echoing a secret, then exits or waits.
struct FakeCompose {
    hold_until_aborted: bool,
}

#[async_trait]
impl ComposeRunner for FakeCompose {
    async fn converge(
        &self,
        invocation: &ComposeInvocation,
        output: mpsc::Sender<OutputLine>,
        mut abort: AbortSignal,
    ) -> Result<ExitSignal, RunnerError> {
        for service in &invocation.services {
            let _ = output
                .send(OutputLine {
                    stream: LogStream::Stdout,
                    line: format!("Container {} Started", service),
                })
                .await;
        }
        let overlay = std::fs::read_to_string(&invocation.overlay)?;
        if overlay.contains("postgres://db") {
            let _ = output
                .send(OutputLine {
                    stream: LogStream::Stderr,
                    line: "connecting to postgres://db".into(),
                })
                .await;
        }

        if self.hold_until_aborted {
            abort.aborted().await;
            return Ok(ExitSignal::Terminated);
        }
        Ok(ExitSignal::Exited(0))
    }

    async fn service_states(
        &self,
        invocation: &ComposeInvocation,
    ) -> Result<Vec<ServiceState>, RunnerError> {
        Ok(invocation
            .services
            .iter()
            .map(|s| ServiceState::new(s.clone(), "running"))
            .collect())
    }
}

struct Harness {
    control_plane: Arc<ControlPlane>,
    telemetry: mpsc::Receiver<TelemetryEvent>,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start(heartbeat_interval_secs: u64, heartbeat_miss_factor: u32) -> Self {
        let config = ControlPlaneConfig {
            heartbeat_interval_secs,
            heartbeat_miss_factor,
            ..ControlPlaneConfig::default()
        };
        let mut auth = StaticTokenAuthenticator::default();
        auth.insert_plaintext("agent_1", "tok_abc");
        auth.insert_plaintext("agent_2", "tok_def");

        let (sink, telemetry) = ChannelSink::new(256);
        let control_plane = ControlPlane::new(config, Arc::new(auth), Arc::new(sink));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(control_plane.clone().serve(listener, shutdown.clone()));

        Self {
            control_plane,
            telemetry,
            addr,
            shutdown,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/agent", self.addr)
    }

    async fn wait_connected(&self, identity: &str, connected: bool) {
        let registry = self.control_plane.registry().clone();
        let identity = identity.to_string();
        tokio::time::timeout(Duration::from_secs(10), async move {
            while registry.is_connected(&identity) != connected {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("registry did not reach the expected state");
    }

    /// Telemetry up to and including the STATUS of `job_id`.
    async fn until_status(&mut self, job_id: &str) -> (Vec<TelemetryEvent>, String, StatusPayload) {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), self.telemetry.recv())
                .await
                .expect("timed out waiting for STATUS")
                .expect("telemetry channel closed");
            if let TelemetryEvent::Status {
                correlation_id,
                status,
                ..
            } = &event
            {
                if status.job_id == job_id {
                    return (seen, correlation_id.clone(), status.clone());
                }
            }
            seen.push(event);
        }
    }
}

struct Agent {
    _dir: tempfile::TempDir,
    overlay_dir: PathBuf,
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Agent {
    fn start(url: &str, runner: FakeCompose) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), COMPOSE).unwrap();
        let overlay_dir = dir.path().join("overlays");

        let config: AgentConfig = serde_json::from_value(json!({
            "identity": "agent_1",
            "credential": "tok_abc",
            "control_plane_url": url,
            "heartbeat_interval_secs": 1,
            "reconnect": { "base_delay_ms": 50, "max_delay_ms": 200, "jitter_ratio": 0.0 },
            "executor": {
                "working_dir": dir.path(),
                "overlay_dir": overlay_dir,
                "verify_settle_secs": 0,
                "verify_poll_interval_secs": 1,
                "verify_timeout_secs": 5
            }
        }))
        .unwrap();

        let agent = HostAgent::with_runner(&config, Arc::new(runner)).unwrap();
        let stop = CancellationToken::new();
        let task = {
            let stop = stop.clone();
            tokio::spawn(async move { agent.run(stop).await })
        };
        Self {
            _dir: dir,
            overlay_dir,
            stop,
            task,
        }
    }

    async fn shutdown(self) {
        self.stop.cancel();
        tokio::time::timeout(Duration::from_secs(20), self.task)
            .await
            .expect("agent did not stop")
            .unwrap();
    }
}

fn deploy(job_id: &str) -> Command {
    Command::Deploy(DeployPayload {
        job_id: job_id.into(),
        target_services: vec!["backend".into()],
        secrets: vec![
            SecretEntry::new("PORT", "8080", Scope::service("backend")),
            SecretEntry::new("DB_URL", "postgres://db", Scope::Global),
        ],
        overlay_hints: OverlayHints::default(),
    })
}

fn accepted(outcome: SubmitOutcome) -> String {
    match outcome {
        SubmitOutcome::Accepted { correlation_id } => correlation_id,
        other => panic!("command not accepted: {:?}", other),
    }
}

fn overlay_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deploy_streams_logs_and_reports_success() {
    let mut harness = Harness::start(30, 3).await;
    let agent = Agent::start(
        &harness.url(),
        FakeCompose {
            hold_until_aborted: false,
        },
    );
    harness.wait_connected("agent_1", true).await;

    let correlation_id = accepted(harness.control_plane.submit_command("agent_1", deploy("job_1")));
    let (events, status_correlation, status) = harness.until_status("job_1").await;

    assert_eq!(status_correlation, correlation_id);
    assert_eq!(status.state, JobState::Success);

    let lines: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            TelemetryEvent::LogChunk {
                identity,
                correlation_id: c,
                chunk,
            } if chunk.stream != LogStream::System => {
                assert_eq!(identity, "agent_1");
                assert_eq!(c, &correlation_id);
                Some(chunk.line.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        lines,
        vec![
            "Container backend Started".to_string(),
            "connecting to ***".to_string()
        ]
    );
    assert_eq!(overlay_count(&agent.overlay_dir), 0);

    agent.shutdown().await;
    harness.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_host_is_not_connected() {
    let harness = Harness::start(30, 3).await;
    let agent = Agent::start(
        &harness.url(),
        FakeCompose {
            hold_until_aborted: false,
        },
    );
    harness.wait_connected("agent_1", true).await;

    assert_eq!(
        harness.control_plane.submit_command("agent_2", deploy("job_1")),
        SubmitOutcome::NotConnected
    );

    agent.shutdown().await;
    harness.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_deploy_is_busy_and_terminate_stops_first() {
    let mut harness = Harness::start(30, 3).await;
    let agent = Agent::start(
        &harness.url(),
        FakeCompose {
            hold_until_aborted: true,
        },
    );
    harness.wait_connected("agent_1", true).await;

    let first = accepted(harness.control_plane.submit_command("agent_1", deploy("job_1")));
    // Wait for the first job to be executing.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), harness.telemetry.recv())
            .await
            .unwrap()
            .unwrap();
        if let TelemetryEvent::LogChunk { chunk, .. } = event {
            if chunk.stream == LogStream::Stdout {
                break;
            }
        }
    }

    let second = accepted(harness.control_plane.submit_command("agent_1", deploy("job_2")));
    let (_, correlation_id, status) = harness.until_status("job_2").await;
    assert_eq!(correlation_id, second);
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.detail.as_deref(), Some("busy"));

    accepted(harness.control_plane.submit_command(
        "agent_1",
        Command::Terminate(TerminatePayload {
            grace_period_seconds: 0,
        }),
    ));
    let (_, correlation_id, status) = harness.until_status("job_1").await;
    assert_eq!(correlation_id, first);
    assert_eq!(status.detail.as_deref(), Some("terminated"));
    assert_eq!(overlay_count(&agent.overlay_dir), 0);

    agent.shutdown().await;
    harness.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_host_is_unregistered() {
    let harness = Harness::start(1, 1).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(harness.url()).await.unwrap();
    let hello = protocol::hello("agent_1", "tok_abc", vec![]);
    ws.send(WsMessage::Text(hello.encode().unwrap())).await.unwrap();

    let ack = match ws.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => Envelope::decode(&text).unwrap(),
        other => panic!("unexpected frame {:?}", other),
    };
    match ack.message {
        Message::HelloAck(payload) => assert!(payload.accepted),
        other => panic!("expected HELLO_ACK, got {:?}", other),
    }
    harness.wait_connected("agent_1", true).await;

    // No heartbeats: the liveness window is one second.
    harness.wait_connected("agent_1", false).await;
    assert_eq!(
        harness.control_plane.submit_command("agent_1", deploy("job_1")),
        SubmitOutcome::NotConnected
    );
    harness.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_reconnects_after_control_plane_restart() {
    let first = Harness::start(30, 3).await;
    let url = first.url();
    let addr = first.addr;
    let agent = Agent::start(
        &url,
        FakeCompose {
            hold_until_aborted: false,
        },
    );
    first.wait_connected("agent_1", true).await;

    first.shutdown.cancel();

    // Same address, fresh control plane.
    let config = ControlPlaneConfig::default();
    let mut auth = StaticTokenAuthenticator::default();
    auth.insert_plaintext("agent_1", "tok_abc");
    let (sink, _telemetry) = ChannelSink::new(16);
    let control_plane = ControlPlane::new(config, Arc::new(auth), Arc::new(sink));
    let listener = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("old listener was not released");
    let shutdown = CancellationToken::new();
    tokio::spawn(control_plane.clone().serve(listener, shutdown.clone()));

    let registry = control_plane.registry().clone();
    tokio::time::timeout(Duration::from_secs(10), async move {
        while !registry.is_connected("agent_1") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("agent did not reconnect");

    agent.shutdown().await;
    shutdown.cancel();
}
