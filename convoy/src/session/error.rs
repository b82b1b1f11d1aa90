//! Session error types

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Failures while establishing or running a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake rejected. Fatal for this connection, not for the supervisor.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Session closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

/// Enqueue failures on the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Outbound queue full")]
    QueueFull,

    #[error("Session closed")]
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the owning component
    Local,
    /// Peer sent a close frame or the stream ended
    PeerClosed,
    /// Read or write failed
    Transport(String),
    /// Malformed or unexpected envelope
    Protocol(String),
    /// No traffic for the liveness window
    HeartbeatTimeout,
    /// Handshake completed but the session was refused (e.g. identity already connected)
    Rejected(String),
    /// Process shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            Self::Rejected(r) => write!(f, "rejected: {}", r),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}
