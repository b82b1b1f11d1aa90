//! Host Agent
//!
//! Wires the reconnect supervisor to the deployment executor. Commands that
//! arrive on the current session go to the executor; job events go back up
//! through whichever session is ACTIVE at the time they are produced.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, ConfigError};
use crate::executor::{
    ComposeRunner, DeploymentExecutor, DockerComposeRunner, ExecutorOptions, JobEvents,
};
use crate::protocol::{self, Envelope, LogChunkPayload, Message, StatusPayload};
use crate::session::{CloseReason, Session};
use crate::supervisor::{
    ReconnectSupervisor, SessionHandler, SupervisorConfig, SupervisorEvent, WsConnector,
};

/// Grace given to an in-flight job when the agent shuts down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Job event path to the control plane.
///
/// Holds the current ACTIVE session, if any. Events produced while
/// disconnected are dropped; the executor never blocks on the network.
#[derive(Default)]
pub struct Uplink {
    session: RwLock<Option<Arc<Session>>>,
}

impl Uplink {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, session: &Arc<Session>) {
        *self.session.write() = Some(session.clone());
    }

    /// Detach `session` unless a newer one already replaced it.
    fn detach(&self, session: &Arc<Session>) {
        let mut current = self.session.write();
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *current = None;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .as_ref()
            .filter(|s| s.is_live())
            .cloned()
    }
}

#[async_trait]
impl JobEvents for Uplink {
    fn log(&self, correlation_id: &str, chunk: LogChunkPayload) {
        let Some(session) = self.current() else {
            debug!("[uplink] No session, LOG_CHUNK for {} dropped", chunk.job_id);
            return;
        };
        let envelope = Envelope::new(correlation_id, Message::LogChunk(chunk));
        if let Err(e) = session.try_send(envelope) {
            warn!("[uplink] LOG_CHUNK dropped: {}", e);
        }
    }

    async fn status(&self, correlation_id: &str, status: StatusPayload, timeout: Duration) -> bool {
        let Some(session) = self.current() else {
            warn!(
                "[uplink] No session, STATUS for job {} dropped",
                status.job_id
            );
            return false;
        };
        match session
            .send_timeout(protocol::status(correlation_id, status), timeout)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("[uplink] STATUS not sent: {}", e);
                false
            }
        }
    }
}

/// Routes downstream commands of the ACTIVE session.
struct CommandRouter {
    uplink: Arc<Uplink>,
    executor: Arc<DeploymentExecutor>,
}

#[async_trait]
impl SessionHandler for CommandRouter {
    async fn on_active(&self, session: &Arc<Session>) {
        self.uplink.attach(session);
    }

    async fn handle(&self, session: &Arc<Session>, envelope: Envelope) {
        let correlation_id = envelope.correlation_id;
        match envelope.message {
            Message::Deploy(payload) => {
                info!(
                    "[agent] DEPLOY {} (correlation {})",
                    payload.job_id, correlation_id
                );
                self.executor.handle_deploy(correlation_id, payload);
            }
            Message::Terminate(payload) => {
                let grace = Duration::from_secs(payload.grace_period_seconds);
                if !self.executor.terminate(grace) {
                    debug!("[agent] TERMINATE ignored, no job in flight");
                }
            }
            other => {
                warn!(
                    "[agent] Unexpected {} from control plane",
                    other.message_type()
                );
                session.close(CloseReason::Protocol(format!(
                    "unexpected {}",
                    other.message_type()
                )));
            }
        }
    }

    async fn on_closed(&self, session: &Arc<Session>) {
        self.uplink.detach(session);
    }
}

/// The host side: one supervised session plus one executor.
pub struct HostAgent {
    supervisor: ReconnectSupervisor<WsConnector>,
    executor: Arc<DeploymentExecutor>,
    uplink: Arc<Uplink>,
}

impl HostAgent {
    /// Agent driving the configured compose program.
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let runner = DockerComposeRunner::new(config.executor.compose_program.clone());
        Self::with_runner(config, Arc::new(runner))
    }

    pub fn with_runner(
        config: &AgentConfig,
        runner: Arc<dyn ComposeRunner>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let supervisor_config = SupervisorConfig::from_agent_config(config)?;

        let uplink = Arc::new(Uplink::new());
        let executor = DeploymentExecutor::new(
            ExecutorOptions::from_settings(&config.executor),
            runner,
            uplink.clone(),
        );
        let router = Arc::new(CommandRouter {
            uplink: uplink.clone(),
            executor: executor.clone(),
        });
        let supervisor = ReconnectSupervisor::new(
            supervisor_config,
            WsConnector::new(config.control_plane_url.clone()),
            router,
        );

        Ok(Self {
            supervisor,
            executor,
            uplink,
        })
    }

    pub fn executor(&self) -> &Arc<DeploymentExecutor> {
        &self.executor
    }

    pub fn uplink(&self) -> &Arc<Uplink> {
        &self.uplink
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.supervisor.subscribe()
    }

    /// Stay connected until `stop` fires, then stop any in-flight job.
    pub async fn run(&self, stop: CancellationToken) {
        info!("[agent] Starting");
        self.supervisor.run(stop).await;

        if self.executor.terminate(SHUTDOWN_GRACE) {
            let wait = SHUTDOWN_GRACE + Duration::from_secs(5);
            if tokio::time::timeout(wait, self.executor.wait_idle())
                .await
                .is_err()
            {
                warn!("[agent] In-flight job did not finish within {:?}", wait);
            }
        }
        info!("[agent] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Direction, JobState, LogStream};
    use crate::session::test_support::ws_pair;
    use crate::session::{SessionConfig, SessionStateMachine};
    use futures_util::StreamExt;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn active_session() -> (
        Arc<Session>,
        tokio_tungstenite::WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (server, client) = ws_pair().await;
        let mut machine = SessionStateMachine::new();
        machine.await_hello().unwrap();
        machine.authenticated().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::start(
            client,
            "agent_1".into(),
            vec![],
            machine,
            SessionConfig::new(Duration::from_secs(30), Direction::Downstream),
            tx,
        );
        assert!(session.activate());
        (session, server)
    }

    async fn next_envelope(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::io::DuplexStream>,
    ) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            WsMessage::Text(text) => Envelope::decode(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    fn chunk(job_id: &str, line: &str) -> LogChunkPayload {
        LogChunkPayload {
            job_id: job_id.into(),
            stream: LogStream::Stdout,
            line: line.into(),
            ts: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_events_without_session_are_dropped() {
        let uplink = Uplink::new();
        assert!(!uplink.is_attached());

        uplink.log("corr", chunk("job_1", "hello"));
        let sent = uplink
            .status(
                "corr",
                StatusPayload::success("job_1"),
                Duration::from_millis(10),
            )
            .await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_events_flow_through_attached_session() {
        let (session, mut server) = active_session().await;
        let uplink = Uplink::new();
        uplink.attach(&session);
        assert!(uplink.is_attached());

        uplink.log("corr-1", chunk("job_1", "pulling"));
        assert!(
            uplink
                .status(
                    "corr-1",
                    StatusPayload::success("job_1"),
                    Duration::from_secs(1)
                )
                .await
        );

        let log = next_envelope(&mut server).await;
        assert_eq!(log.correlation_id, "corr-1");
        match log.message {
            Message::LogChunk(c) => assert_eq!(c.line, "pulling"),
            other => panic!("expected LOG_CHUNK, got {:?}", other),
        }
        let status = next_envelope(&mut server).await;
        assert_eq!(status.correlation_id, "corr-1");
        match status.message {
            Message::Status(s) => assert_eq!(s.state, JobState::Success),
            other => panic!("expected STATUS, got {:?}", other),
        }
        session.close(CloseReason::Local);
    }

    #[tokio::test]
    async fn test_stale_detach_keeps_newer_session() {
        let (old, _old_server) = active_session().await;
        let (new, _new_server) = active_session().await;
        let uplink = Uplink::new();

        uplink.attach(&old);
        uplink.attach(&new);
        uplink.detach(&old);
        assert!(uplink.is_attached());

        uplink.detach(&new);
        assert!(!uplink.is_attached());
    }

    #[tokio::test]
    async fn test_closed_session_is_not_used() {
        let (session, _server) = active_session().await;
        let uplink = Uplink::new();
        uplink.attach(&session);

        session.close(CloseReason::Local);
        assert!(!uplink.is_attached());
    }

    #[tokio::test]
    async fn test_unexpected_downstream_message_closes_session() {
        use crate::executor::VerifyPolicy;
        use crate::protocol::HelloAckPayload;

        let dir = tempfile::tempdir().unwrap();
        let uplink = Arc::new(Uplink::new());
        let executor = DeploymentExecutor::new(
            ExecutorOptions {
                working_dir: dir.path().to_path_buf(),
                overlay_dir: dir.path().join("overlays"),
                execution_timeout: Duration::from_secs(5),
                verify: VerifyPolicy::default(),
                status_send_timeout: Duration::from_secs(1),
            },
            Arc::new(DockerComposeRunner::new("docker")),
            uplink.clone(),
        );
        let router = CommandRouter { uplink, executor };
        let (session, _server) = active_session().await;

        router
            .handle(
                &session,
                Envelope::new("corr-9", Message::HelloAck(HelloAckPayload::accepted())),
            )
            .await;

        assert!(session.is_closing());
        match session.close_reason() {
            Some(CloseReason::Protocol(detail)) => assert!(detail.starts_with("unexpected")),
            other => panic!("expected protocol close, got {:?}", other),
        }
    }
}
