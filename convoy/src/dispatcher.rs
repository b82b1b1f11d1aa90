//! Command Dispatcher
//!
//! Resolves the target session through the registry and enqueues a command
//! envelope. Delivery is at-most-once per attempt: a caller is always told
//! `NotConnected` or `Busy` instead of having a command dropped silently.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::protocol::{DeployPayload, Envelope, Message, TerminatePayload};
use crate::registry::ConnectionRegistry;
use crate::session::SendError;

/// Commands the control plane may send to a host.
#[derive(Debug, Clone)]
pub enum Command {
    Deploy(DeployPayload),
    Terminate(TerminatePayload),
}

impl Command {
    fn into_message(self) -> Message {
        match self {
            Command::Deploy(p) => Message::Deploy(p),
            Command::Terminate(p) => Message::Terminate(p),
        }
    }
}

/// Result of `submit_command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Enqueued on the agent's session; events will carry this correlation id.
    Accepted { correlation_id: String },
    /// No live session for the identity.
    NotConnected,
    /// The session's outbound queue is full.
    Busy,
}

pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Submit a command to `identity` with a fresh correlation id.
    pub fn submit_command(&self, identity: &str, command: Command) -> SubmitOutcome {
        self.submit_envelope(identity, Envelope::fresh(command.into_message()))
    }

    /// Submit with a caller-chosen correlation id (e.g. the trigger's request id).
    pub fn submit_correlated(
        &self,
        identity: &str,
        correlation_id: impl Into<String>,
        command: Command,
    ) -> SubmitOutcome {
        self.submit_envelope(identity, Envelope::new(correlation_id, command.into_message()))
    }

    fn submit_envelope(&self, identity: &str, envelope: Envelope) -> SubmitOutcome {
        let Some(session) = self.registry.lookup(identity) else {
            debug!("[dispatcher] {} not connected", identity);
            return SubmitOutcome::NotConnected;
        };

        let correlation_id = envelope.correlation_id.clone();
        let summary = describe(&envelope.message);

        match session.try_send(envelope) {
            Ok(()) => {
                info!(
                    "[dispatcher] {} -> {} (correlation {})",
                    summary, identity, correlation_id
                );
                SubmitOutcome::Accepted { correlation_id }
            }
            Err(SendError::QueueFull) => {
                warn!("[dispatcher] {} outbound queue full, {} refused", identity, summary);
                SubmitOutcome::Busy
            }
            Err(SendError::Closed) => {
                debug!("[dispatcher] {} closed during submit", identity);
                SubmitOutcome::NotConnected
            }
        }
    }
}

/// Log-safe one-liner. Secret values never appear here.
fn describe(message: &Message) -> String {
    match message {
        Message::Deploy(p) => format!(
            "DEPLOY job={} targets={:?} secrets={}",
            p.job_id,
            p.target_services,
            p.secrets.len()
        ),
        Message::Terminate(p) => format!("TERMINATE grace={}s", p.grace_period_seconds),
        other => other.message_type().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Direction, OverlayHints};
    use crate::secrets::{Scope, SecretEntry};
    use crate::session::test_support::ws_pair;
    use crate::session::{Session, SessionConfig, SessionStateMachine};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio_tungstenite::WebSocketStream;

    fn deploy(job_id: &str) -> Command {
        Command::Deploy(DeployPayload {
            job_id: job_id.into(),
            target_services: vec!["backend".into()],
            secrets: vec![SecretEntry::new("PORT", "8080", Scope::service("backend"))],
            overlay_hints: OverlayHints::default(),
        })
    }

    fn start(
        ws: WebSocketStream<DuplexStream>,
        capacity: usize,
    ) -> (Arc<Session>, mpsc::Receiver<Envelope>) {
        let mut sm = SessionStateMachine::new();
        sm.await_hello().unwrap();
        sm.authenticated().unwrap();
        let mut cfg = SessionConfig::new(Duration::from_secs(30), Direction::Upstream);
        cfg.outbound_capacity = capacity;
        let (tx, rx) = mpsc::channel(8);
        let session = Session::start(ws, "agent_1".into(), vec![], sm, cfg, tx);
        session.activate();
        (session, rx)
    }

    #[test]
    fn test_not_connected_sends_nothing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = CommandDispatcher::new(registry);
        assert_eq!(
            dispatcher.submit_command("agent_2", deploy("job_9")),
            SubmitOutcome::NotConnected
        );
    }

    #[tokio::test]
    async fn test_accepted_command_reaches_agent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (server, mut client) = ws_pair().await;
        let (session, _rx) = start(server, 16);
        registry.register(session).unwrap();

        let dispatcher = CommandDispatcher::new(registry);
        let outcome = dispatcher.submit_correlated("agent_1", "corr-1", deploy("job_1"));
        assert_eq!(
            outcome,
            SubmitOutcome::Accepted {
                correlation_id: "corr-1".into()
            }
        );

        let frame = client.next().await.unwrap().unwrap();
        let env = Envelope::decode(frame.to_text().unwrap()).unwrap();
        assert_eq!(env.correlation_id, "corr-1");
        assert!(matches!(env.message, Message::Deploy(ref p) if p.job_id == "job_1"));
    }

    #[tokio::test]
    async fn test_closed_session_reports_not_connected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (server, _client) = ws_pair().await;
        let (session, _rx) = start(server, 16);
        registry.register(session.clone()).unwrap();
        session.close(crate::session::CloseReason::Local);

        let dispatcher = CommandDispatcher::new(registry);
        assert_eq!(
            dispatcher.submit_command("agent_1", deploy("job_1")),
            SubmitOutcome::NotConnected
        );
    }

    #[tokio::test]
    async fn test_stalled_peer_reports_busy() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (server, _client) = ws_pair().await;
        let (session, _rx) = start(server, 1);
        registry.register(session).unwrap();
        let dispatcher = CommandDispatcher::new(registry);

        let mut busy = false;
        for i in 0..10_000 {
            match dispatcher.submit_command("agent_1", deploy(&format!("job_{}", i))) {
                SubmitOutcome::Accepted { .. } => tokio::task::yield_now().await,
                SubmitOutcome::Busy => {
                    busy = true;
                    break;
                }
                SubmitOutcome::NotConnected => panic!("unexpected disconnect"),
            }
        }
        assert!(busy);
    }
}
