//! Reconnect Supervisor
//!
//! Owns the host's single outbound session. Each cycle connects, performs the
//! HELLO handshake, heartbeats while the session is ACTIVE, and backs off
//! after any failure. Retries are unbounded until the stop token fires.
//!
//! ```text
//!   ┌──────────► Attempting ──fail──► BackingOff ──┐
//!   │                │                              │
//!   │             Connected (attempt := 0)          │
//!   │                │                              │
//!   └─────────── Disconnected ◄─────────────────────┘
//! ```

mod backoff;

pub use backoff::Backoff;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, ConfigError};
use crate::protocol::{self, Envelope, MAX_ENVELOPE_SIZE};
use crate::secrets::SecretValue;
use crate::session::{handshake, CloseReason, Session, SessionConfig, SessionError, SessionStateMachine};

const EVENT_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 64;

/// Lifecycle transitions, reported to subscribers and the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Attempting { attempt: u32 },
    Connected,
    Disconnected { reason: String },
    BackingOff { attempt: u32, delay: Duration },
    Stopped,
}

/// Opens the transport for one connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<WebSocketStream<Self::Io>, SessionError>;
}

/// Connects to a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Io = MaybeTlsStream<TcpStream>;

    async fn connect(&self) -> Result<WebSocketStream<Self::Io>, SessionError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_ENVELOPE_SIZE * 2);
        config.max_frame_size = Some(MAX_ENVELOPE_SIZE * 2);
        let (ws, _) =
            tokio_tungstenite::connect_async_with_config(self.url.as_str(), Some(config), true)
                .await?;
        Ok(ws)
    }
}

/// Consumes the traffic of each ACTIVE session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// The session just became ACTIVE.
    async fn on_active(&self, _session: &Arc<Session>) {}

    /// One inbound envelope. HEARTBEAT_ACK never reaches this.
    async fn handle(&self, session: &Arc<Session>, envelope: Envelope);

    /// The session is gone; no more envelopes will arrive for it.
    async fn on_closed(&self, _session: &Arc<Session>) {}
}

/// Identity and timing of the outbound session.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub identity: String,
    pub credential: SecretValue,
    pub capabilities: Vec<String>,
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
    pub backoff: Backoff,
}

impl SupervisorConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            identity: config.identity.clone(),
            credential: SecretValue::new(config.resolve_credential()?),
            capabilities: config.capabilities.clone(),
            handshake_timeout: config.handshake_timeout(),
            session: config.session_config(),
            backoff: Backoff::from_config(&config.reconnect),
        })
    }
}

pub struct ReconnectSupervisor<C: Connector> {
    config: SupervisorConfig,
    connector: C,
    handler: Arc<dyn SessionHandler>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl<C: Connector> ReconnectSupervisor<C> {
    pub fn new(config: SupervisorConfig, connector: C, handler: Arc<dyn SessionHandler>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            connector,
            handler,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Run until `stop` fires. Only one connection attempt is ever in flight.
    pub async fn run(&self, stop: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            self.emit(SupervisorEvent::Attempting { attempt });

            let established = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                result = self.establish() => result,
            };

            match established {
                Ok((session, inbound)) => {
                    attempt = 0;
                    self.emit(SupervisorEvent::Connected);
                    let reason = self.serve(session, inbound, &stop).await;
                    self.emit(SupervisorEvent::Disconnected {
                        reason: reason.to_string(),
                    });
                }
                Err(e) => {
                    self.emit(SupervisorEvent::Disconnected {
                        reason: e.to_string(),
                    });
                }
            }

            if stop.is_cancelled() {
                break;
            }

            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            self.emit(SupervisorEvent::BackingOff { attempt, delay });

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.emit(SupervisorEvent::Stopped);
    }

    /// Connect and authenticate; the returned session is ACTIVE.
    async fn establish(&self) -> Result<(Arc<Session>, mpsc::Receiver<Envelope>), SessionError> {
        let mut ws = self.connector.connect().await?;

        let mut machine = SessionStateMachine::new();
        let hello = protocol::hello(
            self.config.identity.clone(),
            self.config.credential.expose(),
            self.config.capabilities.clone(),
        );
        handshake::initiate(&mut ws, &mut machine, hello, self.config.handshake_timeout).await?;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let session = Session::start(
            ws,
            self.config.identity.clone(),
            self.config.capabilities.clone(),
            machine,
            self.config.session.clone(),
            tx,
        );
        if !session.activate() {
            return Err(SessionError::Closed);
        }
        Ok((session, rx))
    }

    /// Heartbeat and route inbound traffic until the session closes or
    /// `stop` fires.
    async fn serve(
        &self,
        session: Arc<Session>,
        mut inbound: mpsc::Receiver<Envelope>,
        stop: &CancellationToken,
    ) -> CloseReason {
        self.handler.on_active(&session).await;

        let mut ticker = tokio::time::interval(self.config.session.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    session.close(CloseReason::Shutdown);
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = session.try_send(protocol::heartbeat()) {
                        debug!("[supervisor] Heartbeat not queued: {}", e);
                    }
                }
                next = inbound.recv() => match next {
                    Some(envelope) => {
                        if matches!(envelope.message, protocol::Message::HeartbeatAck) {
                            continue;
                        }
                        self.handler.handle(&session, envelope).await;
                    }
                    None => break,
                },
            }
        }

        session.close(CloseReason::Local);
        let reason = session.closed().await;
        self.handler.on_closed(&session).await;
        reason
    }

    fn emit(&self, event: SupervisorEvent) {
        match &event {
            SupervisorEvent::Attempting { attempt } => {
                debug!("[supervisor] Connecting (attempt {})", attempt)
            }
            SupervisorEvent::Connected => info!("[supervisor] Session active"),
            SupervisorEvent::Disconnected { reason } => {
                warn!("[supervisor] Disconnected: {}", reason)
            }
            SupervisorEvent::BackingOff { attempt, delay } => {
                info!("[supervisor] Retry {} in {:?}", attempt, delay)
            }
            SupervisorEvent::Stopped => info!("[supervisor] Stopped"),
        }
        let _ = self.events.send(event);
    }
}
