//! Control-plane server
//!
//! Accepts agent connections, runs the HELLO handshake, binds each session in
//! the [`ConnectionRegistry`] and forwards job telemetry to a
//! [`TelemetrySink`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::config::ControlPlaneConfig;
use crate::dispatcher::{Command, CommandDispatcher, SubmitOutcome};
use crate::protocol::{
    Envelope, HelloAckPayload, LogChunkPayload, Message, StatusPayload, MAX_ENVELOPE_SIZE,
};
use crate::registry::ConnectionRegistry;
use crate::session::{handshake, CloseReason, Session, SessionStateMachine};

/// Inbound envelopes buffered between a session's reader and its router.
const INBOUND_CAPACITY: usize = 64;

/// Time connection tasks get to wind down after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Reason sent to a second connection for an identity that is already live.
pub const ALREADY_CONNECTED: &str = "already connected";

/// Job telemetry forwarded from an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    LogChunk {
        identity: String,
        correlation_id: String,
        chunk: LogChunkPayload,
    },
    Status {
        identity: String,
        correlation_id: String,
        status: StatusPayload,
    },
}

impl TelemetryEvent {
    pub fn correlation_id(&self) -> &str {
        match self {
            TelemetryEvent::LogChunk { correlation_id, .. }
            | TelemetryEvent::Status { correlation_id, .. } => correlation_id,
        }
    }
}

/// Receives LOG_CHUNK and STATUS events keyed by correlation id.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn deliver(&self, event: TelemetryEvent);
}

/// Writes telemetry as log records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn deliver(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::LogChunk {
                identity,
                correlation_id,
                chunk,
            } => info!(
                "[telemetry] {} job={} corr={} {:?}: {}",
                identity, chunk.job_id, correlation_id, chunk.stream, chunk.line
            ),
            TelemetryEvent::Status {
                identity,
                correlation_id,
                status,
            } => info!(
                "[telemetry] {} job={} corr={} status={:?} {}",
                identity,
                status.job_id,
                correlation_id,
                status.state,
                status.detail.unwrap_or_default()
            ),
        }
    }
}

/// Hands telemetry to an embedding application over a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TelemetrySink for ChannelSink {
    async fn deliver(&self, event: TelemetryEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("[telemetry] Channel receiver dropped");
        }
    }
}

/// The control plane: registry, dispatcher and connection acceptor.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    registry: Arc<ConnectionRegistry>,
    dispatcher: CommandDispatcher,
    authenticator: Arc<dyn Authenticator>,
    sink: Arc<dyn TelemetrySink>,
}

impl ControlPlane {
    pub fn new(
        config: ControlPlaneConfig,
        authenticator: Arc<dyn Authenticator>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        Arc::new(Self {
            config,
            dispatcher: CommandDispatcher::new(registry.clone()),
            registry,
            authenticator,
            sink,
        })
    }

    /// Build with a [`StaticTokenAuthenticator`] over the configured agents.
    pub fn from_config(config: ControlPlaneConfig, sink: Arc<dyn TelemetrySink>) -> Arc<Self> {
        let authenticator = StaticTokenAuthenticator::new(config.credential_digests());
        Self::new(config, Arc::new(authenticator), sink)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Submit a command to the live session of `identity`.
    pub fn submit_command(&self, identity: &str, command: Command) -> SubmitOutcome {
        self.dispatcher.submit_command(identity, command)
    }

    /// Submit a command with a caller-chosen correlation id.
    pub fn submit_correlated(
        &self,
        identity: &str,
        correlation_id: impl Into<String>,
        command: Command,
    ) -> SubmitOutcome {
        self.dispatcher
            .submit_correlated(identity, correlation_id, command)
    }

    /// Accept connections until `shutdown` fires, then close every session.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        info!("[control-plane] Listening on {}", listener.local_addr()?);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = self.clone();
                        connections.spawn(async move { this.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        warn!("[control-plane] Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!(
            "[control-plane] Shutting down, closing {} session(s)",
            self.registry.count()
        );
        self.registry.close_all(CloseReason::Shutdown);

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("[control-plane] Connections did not finish in {:?}", SHUTDOWN_GRACE);
            connections.abort_all();
        }
        // Handshakes that completed during the drain.
        self.registry.close_all(CloseReason::Shutdown);
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);

        // Hard cap well above the envelope limit; the envelope layer reports
        // oversize frames as protocol failures.
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_ENVELOPE_SIZE * 2);
        ws_config.max_frame_size = Some(MAX_ENVELOPE_SIZE * 2);

        let timeout = self.config.handshake_timeout();
        let mut ws = match tokio::time::timeout(
            timeout,
            tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)),
        )
        .await
        {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                debug!("[control-plane] WebSocket upgrade from {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                debug!("[control-plane] WebSocket upgrade from {} timed out", peer);
                return;
            }
        };

        let mut machine = SessionStateMachine::new();
        let hello = match handshake::accept(
            &mut ws,
            &mut machine,
            self.authenticator.as_ref(),
            timeout,
        )
        .await
        {
            Ok(hello) => hello,
            Err(e) => {
                info!("[control-plane] Handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let session = Session::start(
            ws,
            hello.identity.clone(),
            hello.capabilities,
            machine,
            self.config.session_config(),
            inbound_tx,
        );

        if let Err(e) = self.registry.register(session.clone()) {
            info!("[control-plane] Rejecting {} from {}: {}", hello.identity, peer, e);
            let _ = session.try_send(Envelope::new(
                hello.correlation_id,
                Message::HelloAck(HelloAckPayload::rejected(ALREADY_CONNECTED)),
            ));
            session.close(CloseReason::Rejected(ALREADY_CONNECTED.to_string()));
            session.closed().await;
            return;
        }

        // Queue is fresh; the ack always fits.
        let _ = session.try_send(Envelope::new(
            hello.correlation_id,
            Message::HelloAck(HelloAckPayload::accepted()),
        ));
        session.activate();
        info!("[control-plane] {} connected from {}", hello.identity, peer);

        self.route_inbound(&session, inbound_rx).await;

        // The identity is free as soon as the session stops routing; the
        // writer may still be flushing to a stalled peer.
        session.close(CloseReason::Local);
        self.registry.unregister_session(&session);
        let reason = session.closed().await;
        let uptime = chrono::Utc::now() - session.connected_at();
        info!(
            "[control-plane] {} disconnected after {}s: {}",
            hello.identity,
            uptime.num_seconds(),
            reason
        );
    }

    /// Handle envelopes from one agent until its session closes.
    async fn route_inbound(&self, session: &Arc<Session>, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            if session.is_closing() {
                break;
            }
            let Envelope {
                correlation_id,
                message,
            } = envelope;

            match message {
                Message::Heartbeat => {
                    let ack = Envelope::new(correlation_id, Message::HeartbeatAck);
                    if let Err(e) = session.try_send(ack) {
                        debug!("[control-plane] {} heartbeat ack not sent: {}", session.identity(), e);
                    }
                }
                Message::LogChunk(chunk) => {
                    self.sink
                        .deliver(TelemetryEvent::LogChunk {
                            identity: session.identity().to_string(),
                            correlation_id,
                            chunk,
                        })
                        .await;
                }
                Message::Status(status) => {
                    self.sink
                        .deliver(TelemetryEvent::Status {
                            identity: session.identity().to_string(),
                            correlation_id,
                            status,
                        })
                        .await;
                }
                other => {
                    warn!(
                        "[control-plane] {} sent unexpected {}",
                        session.identity(),
                        other.message_type()
                    );
                    session.close(CloseReason::Protocol(format!(
                        "unexpected {}",
                        other.message_type()
                    )));
                    break;
                }
            }
        }
    }
}
