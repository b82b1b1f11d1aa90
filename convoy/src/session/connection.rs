//! Session runtime: framed envelope exchange over one WebSocket
//!
//! A started session owns three tasks:
//!
//! ```text
//!            outbound queue (bounded)             inbound channel
//! owner ──► [ writer task ] ──► WebSocket ──► [ reader task ] ──► owner
//!                                   ▲
//!                         [ liveness monitor ]
//! ```
//!
//! - Outbound envelopes reach the transport in enqueue order
//! - Any inbound frame refreshes the liveness timestamp
//! - Silence longer than the liveness window closes the session
//! - `close()` is idempotent; the first reason wins and no envelope is
//!   delivered inbound after it returns

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{CloseReason, SendError};
use super::state::{SessionState, SessionStateMachine};
use crate::protocol::{Direction, Envelope};

/// Upper bound for flushing queued envelopes and the close frame on teardown.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime parameters for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Nominal heartbeat interval of the host.
    pub heartbeat_interval: Duration,
    /// Silence longer than `heartbeat_interval * heartbeat_miss_factor` closes the session.
    pub heartbeat_miss_factor: u32,
    /// How often the liveness monitor checks for silence.
    pub liveness_tick: Duration,
    /// Capacity of the outbound queue.
    pub outbound_capacity: usize,
    /// Direction of envelopes this side accepts.
    pub inbound_direction: Direction,
}

impl SessionConfig {
    pub fn new(heartbeat_interval: Duration, inbound_direction: Direction) -> Self {
        Self {
            heartbeat_interval,
            heartbeat_miss_factor: 3,
            liveness_tick: heartbeat_interval / 2,
            outbound_capacity: 256,
            inbound_direction,
        }
    }

    /// Silence allowed before teardown.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_miss_factor.max(1)
    }
}

/// A live, authenticated control channel session.
pub struct Session {
    identity: String,
    capabilities: Vec<String>,
    connected_at: DateTime<Utc>,

    state: Mutex<SessionStateMachine>,
    last_seen: Mutex<Instant>,

    /// Send envelopes to the writer task.
    outbound: mpsc::Sender<Envelope>,

    /// Set by the first `close()`.
    closing: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,

    /// Published once every task has exited.
    closed_tx: watch::Sender<Option<CloseReason>>,
}

impl Session {
    /// Start the reader, writer and liveness tasks on an authenticated socket.
    ///
    /// `machine` must be in `Authenticated`; call [`Session::activate`] once
    /// the owner is ready to serve traffic. Decoded envelopes are delivered to
    /// `inbound` in arrival order.
    pub fn start<S>(
        ws: WebSocketStream<S>,
        identity: String,
        capabilities: Vec<String>,
        machine: SessionStateMachine,
        config: SessionConfig,
        inbound: mpsc::Sender<Envelope>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (closed_tx, _) = watch::channel(None);

        let session = Arc::new(Self {
            identity,
            capabilities,
            connected_at: Utc::now(),
            state: Mutex::new(machine),
            last_seen: Mutex::new(Instant::now()),
            outbound: out_tx,
            closing: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed_tx,
        });

        let (sink, stream) = ws.split();

        let writer = tokio::spawn(write_loop(session.clone(), sink, out_rx));
        let reader = tokio::spawn(read_loop(
            session.clone(),
            stream,
            inbound,
            config.inbound_direction,
        ));
        let monitor = tokio::spawn(liveness_loop(
            session.clone(),
            config.liveness_timeout(),
            config.liveness_tick.max(Duration::from_millis(10)),
        ));

        // Reaper: publish closure once every task is gone.
        let reaper = session.clone();
        tokio::spawn(async move {
            let _ = tokio::join!(writer, reader, monitor);
            let reason = reaper
                .close_reason
                .lock()
                .clone()
                .unwrap_or(CloseReason::Local);
            {
                let mut sm = reaper.state.lock();
                if !sm.is_closing() {
                    let _ = sm.begin_close();
                }
                let _ = sm.finish_close();
            }
            info!(
                "[session] {} closed: {}",
                reaper.identity, reason
            );
            reaper.closed_tx.send_replace(Some(reason));
        });

        session
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state()
    }

    /// Active and not closing.
    pub fn is_live(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && self.state.lock().is_active()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Move from Authenticated to Active.
    pub fn activate(&self) -> bool {
        if self.is_closing() {
            return false;
        }
        self.state.lock().activate().is_ok()
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// When the session was bound after its handshake.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Enqueue without waiting. Fails fast on a full queue.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.is_closing() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Enqueue, waiting at most `timeout` for queue space.
    pub async fn send_timeout(&self, envelope: Envelope, timeout: Duration) -> Result<(), SendError> {
        if self.is_closing() {
            return Err(SendError::Closed);
        }
        self.outbound
            .send_timeout(envelope, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => SendError::QueueFull,
                mpsc::error::SendTimeoutError::Closed(_) => SendError::Closed,
            })
    }

    /// Tear the session down. Returns `false` if it was already closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("[session] {} closing: {}", self.identity, reason);
        *self.close_reason.lock() = Some(reason);
        let _ = self.state.lock().begin_close();
        self.cancel.cancel();
        true
    }

    /// Wait until every session task has exited.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::Local;
            }
        }
    }

    /// Reason recorded by the first `close()`, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

async fn write_loop<S>(
    session: Arc<Session>,
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut out_rx: mpsc::Receiver<Envelope>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cancel = session.cancel.clone();

    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = out_rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("[session] {} dropping unencodable envelope: {}", session.identity, e);
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = sink.send(WsMessage::Text(text)) => {
                if let Err(e) = result {
                    warn!("[session] {} write failed: {}", session.identity, e);
                    session.close(CloseReason::Transport(e.to_string()));
                    return;
                }
            }
        }
    }

    // Flush whatever was queued before the close, then say goodbye.
    let flush = async {
        out_rx.close();
        while let Some(envelope) = out_rx.recv().await {
            if let Ok(text) = envelope.encode() {
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
        }
        let _ = sink.close().await;
    };
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await.is_err() {
        debug!("[session] {} close flush timed out", session.identity);
    }
}

async fn read_loop<S>(
    session: Arc<Session>,
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::Sender<Envelope>,
    direction: Direction,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cancel = session.cancel.clone();

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                session.touch();
                let envelope = match Envelope::decode_from(&text, direction) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("[session] {} protocol error: {}", session.identity, e);
                        session.close(CloseReason::Protocol(e.to_string()));
                        break;
                    }
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = inbound.send(envelope) => {
                        if sent.is_err() {
                            debug!("[session] {} inbound consumer gone", session.identity);
                            session.close(CloseReason::Local);
                            break;
                        }
                    }
                }
            }
            Some(Ok(WsMessage::Binary(_))) => {
                session.close(CloseReason::Protocol("binary frame".to_string()));
                break;
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                session.close(CloseReason::PeerClosed);
                break;
            }
            Some(Ok(_)) => {
                // Ping / Pong / raw frames: traffic, but no envelope
                session.touch();
            }
            Some(Err(e)) => {
                session.close(CloseReason::Transport(e.to_string()));
                break;
            }
        }
    }
}

async fn liveness_loop(session: Arc<Session>, timeout: Duration, tick: Duration) {
    let cancel = session.cancel.clone();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let idle = session.idle_for();
                if idle > timeout {
                    warn!(
                        "[session] {} silent for {:?} (limit {:?})",
                        session.identity, idle, timeout
                    );
                    session.close(CloseReason::HeartbeatTimeout);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{heartbeat, Message};
    use crate::session::test_support::ws_pair;

    fn authenticated() -> SessionStateMachine {
        let mut sm = SessionStateMachine::new();
        sm.await_hello().unwrap();
        sm.authenticated().unwrap();
        sm
    }

    fn config(interval_ms: u64) -> SessionConfig {
        let mut cfg = SessionConfig::new(Duration::from_millis(interval_ms), Direction::Upstream);
        cfg.liveness_tick = Duration::from_millis(interval_ms / 2);
        cfg
    }

    #[tokio::test]
    async fn test_inbound_delivery_and_liveness_touch() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::channel(8);
        let session = Session::start(
            server,
            "agent_1".into(),
            vec![],
            authenticated(),
            config(1000),
            tx,
        );
        assert!(session.activate());
        assert!(session.is_live());

        client
            .send(WsMessage::Text(heartbeat().encode().unwrap()))
            .await
            .unwrap();
        let env = rx.recv().await.unwrap();
        assert!(matches!(env.message, Message::Heartbeat));
        assert!(session.idle_for() < Duration::from_millis(500));

        session.close(CloseReason::Local);
        assert_eq!(session.closed().await, CloseReason::Local);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_outbound_order_preserved() {
        let (server, mut client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::start(
            server,
            "agent_1".into(),
            vec![],
            authenticated(),
            config(1000),
            tx,
        );
        session.activate();

        for i in 0..20 {
            session
                .try_send(Envelope::new(format!("c-{}", i), Message::HeartbeatAck))
                .unwrap();
        }
        for i in 0..20 {
            let frame = client.next().await.unwrap().unwrap();
            let env = Envelope::decode(frame.to_text().unwrap()).unwrap();
            assert_eq!(env.correlation_id, format!("c-{}", i));
        }
        session.close(CloseReason::Local);
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let (server, _client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut cfg = config(1000);
        cfg.outbound_capacity = 1;
        let session = Session::start(server, "a".into(), vec![], authenticated(), cfg, tx);

        // Nobody reads the client side; eventually the queue is full.
        let mut saw_full = false;
        for _ in 0..10_000 {
            match session.try_send(Envelope::fresh(Message::HeartbeatAck)) {
                Ok(()) => tokio::task::yield_now().await,
                Err(SendError::QueueFull) => {
                    saw_full = true;
                    break;
                }
                Err(SendError::Closed) => panic!("session closed unexpectedly"),
            }
        }
        assert!(saw_full);
        session.close(CloseReason::Local);
    }

    #[tokio::test]
    async fn test_silence_tears_session_down() {
        let (server, _client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::start(
            server,
            "quiet".into(),
            vec![],
            authenticated(),
            config(40),
            tx,
        );
        session.activate();

        let reason = tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("liveness monitor should close the session");
        assert_eq!(reason, CloseReason::HeartbeatTimeout);
        assert!(!session.is_live());
    }

    #[tokio::test]
    async fn test_malformed_envelope_closes_session() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::channel(8);
        let session = Session::start(server, "a".into(), vec![], authenticated(), config(1000), tx);
        session.activate();

        client
            .send(WsMessage::Text("{\"type\":\"NOPE\",\"correlation_id\":\"x\"}".into()))
            .await
            .unwrap();

        let reason = session.closed().await;
        assert!(matches!(reason, CloseReason::Protocol(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, _client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::start(server, "a".into(), vec![], authenticated(), config(1000), tx);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = session.clone();
                tokio::spawn(async move { s.close(CloseReason::Shutdown) })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(session.closed().await, CloseReason::Shutdown);
        assert_eq!(session.try_send(heartbeat()), Err(SendError::Closed));
    }
}
