//! Envelope codec for the control channel
//!
//! Every WebSocket text frame carries exactly one envelope:
//!
//! ```text
//! { "type": "DEPLOY", "correlation_id": "…", "payload": { … } }
//! ```
//!
//! Message types:
//! - Commands: HELLO, DEPLOY, TERMINATE, HEARTBEAT
//! - Events:   HELLO_ACK, LOG_CHUNK, STATUS, HEARTBEAT_ACK
//!
//! Anything that does not decode into one of these is a protocol failure;
//! the session closes rather than skipping the frame.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::messages::*;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Envelope discriminator as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Deploy,
    Terminate,
    Heartbeat,
    HelloAck,
    LogChunk,
    Status,
    HeartbeatAck,
}

/// Command or event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Command,
    Event,
}

/// Which side sends a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Execution host → control plane
    Upstream,
    /// Control plane → execution host
    Downstream,
}

impl MessageType {
    /// Parse the wire name
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "HELLO" => Some(Self::Hello),
            "DEPLOY" => Some(Self::Deploy),
            "TERMINATE" => Some(Self::Terminate),
            "HEARTBEAT" => Some(Self::Heartbeat),
            "HELLO_ACK" => Some(Self::HelloAck),
            "LOG_CHUNK" => Some(Self::LogChunk),
            "STATUS" => Some(Self::Status),
            "HEARTBEAT_ACK" => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Wire name
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Deploy => "DEPLOY",
            Self::Terminate => "TERMINATE",
            Self::Heartbeat => "HEARTBEAT",
            Self::HelloAck => "HELLO_ACK",
            Self::LogChunk => "LOG_CHUNK",
            Self::Status => "STATUS",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Self::Hello | Self::Deploy | Self::Terminate | Self::Heartbeat => Family::Command,
            Self::HelloAck | Self::LogChunk | Self::Status | Self::HeartbeatAck => Family::Event,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Hello | Self::Heartbeat | Self::LogChunk | Self::Status => Direction::Upstream,
            Self::Deploy | Self::Terminate | Self::HelloAck | Self::HeartbeatAck => {
                Direction::Downstream
            }
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Decoded message body.
#[derive(Debug, Clone)]
pub enum Message {
    Hello(HelloPayload),
    Deploy(DeployPayload),
    Terminate(TerminatePayload),
    Heartbeat,
    HelloAck(HelloAckPayload),
    LogChunk(LogChunkPayload),
    Status(StatusPayload),
    HeartbeatAck,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hello(_) => MessageType::Hello,
            Self::Deploy(_) => MessageType::Deploy,
            Self::Terminate(_) => MessageType::Terminate,
            Self::Heartbeat => MessageType::Heartbeat,
            Self::HelloAck(_) => MessageType::HelloAck,
            Self::LogChunk(_) => MessageType::LogChunk,
            Self::Status(_) => MessageType::Status,
            Self::HeartbeatAck => MessageType::HeartbeatAck,
        }
    }
}

/// Protocol errors. Never carries payload contents, which may hold secrets.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Envelope too large: {0} bytes")]
    TooLarge(usize),

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },

    #[error("Unexpected {0} in this direction")]
    WrongDirection(MessageType),

    #[error("Failed to serialize envelope: {0}")]
    Serialize(String),
}

/// Raw wire shape shared by all types.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    correlation_id: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// `{type, correlation_id, payload}`
#[derive(Debug, Clone)]
pub struct Envelope {
    pub correlation_id: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(correlation_id: impl Into<String>, message: Message) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            message,
        }
    }

    /// New envelope with a fresh correlation id.
    pub fn fresh(message: Message) -> Self {
        Self::new(Uuid::new_v4().to_string(), message)
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let ser = |e: serde_json::Error| ProtocolError::Serialize(e.to_string());
        let payload = match &self.message {
            Message::Hello(p) => serde_json::to_value(p).map_err(ser)?,
            Message::Deploy(p) => serde_json::to_value(p).map_err(ser)?,
            Message::Terminate(p) => serde_json::to_value(p).map_err(ser)?,
            Message::HelloAck(p) => serde_json::to_value(p).map_err(ser)?,
            Message::LogChunk(p) => serde_json::to_value(p).map_err(ser)?,
            Message::Status(p) => serde_json::to_value(p).map_err(ser)?,
            Message::Heartbeat | Message::HeartbeatAck => serde_json::json!({}),
        };
        let raw = RawEnvelope {
            kind: self.message_type().as_wire().to_string(),
            correlation_id: self.correlation_id.clone(),
            payload,
        };
        let text = serde_json::to_string(&raw).map_err(ser)?;
        if text.len() > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::TooLarge(text.len()));
        }
        Ok(text)
    }

    /// Decode one JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::TooLarge(text.len()));
        }

        // serde_json errors can quote input; keep only the position.
        let raw: RawEnvelope = serde_json::from_str(text).map_err(|e| {
            ProtocolError::Malformed(format!("line {} column {}", e.line(), e.column()))
        })?;

        let kind = MessageType::from_wire(&raw.kind)
            .ok_or_else(|| ProtocolError::UnknownType(raw.kind.clone()))?;

        if raw.correlation_id.is_empty() {
            return Err(ProtocolError::Malformed("empty correlation_id".to_string()));
        }

        let payload = raw.payload;
        let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
            kind,
            reason: format!("{:?} at line {} column {}", e.classify(), e.line(), e.column()),
        };

        let message = match kind {
            MessageType::Hello => Message::Hello(serde_json::from_value(payload).map_err(invalid)?),
            MessageType::Deploy => {
                Message::Deploy(serde_json::from_value(payload).map_err(invalid)?)
            }
            MessageType::Terminate => {
                Message::Terminate(serde_json::from_value(payload).map_err(invalid)?)
            }
            MessageType::HelloAck => {
                Message::HelloAck(serde_json::from_value(payload).map_err(invalid)?)
            }
            MessageType::LogChunk => {
                Message::LogChunk(serde_json::from_value(payload).map_err(invalid)?)
            }
            MessageType::Status => {
                Message::Status(serde_json::from_value(payload).map_err(invalid)?)
            }
            MessageType::Heartbeat => Message::Heartbeat,
            MessageType::HeartbeatAck => Message::HeartbeatAck,
        };

        Ok(Self {
            correlation_id: raw.correlation_id,
            message,
        })
    }

    /// Decode and require the given direction.
    pub fn decode_from(text: &str, direction: Direction) -> Result<Self, ProtocolError> {
        let envelope = Self::decode(text)?;
        let kind = envelope.message_type();
        if kind.direction() != direction {
            return Err(ProtocolError::WrongDirection(kind));
        }
        Ok(envelope)
    }
}

/// HELLO envelope with a fresh correlation id.
pub fn hello(
    identity: impl Into<String>,
    credential: impl Into<String>,
    capabilities: Vec<String>,
) -> Envelope {
    Envelope::fresh(Message::Hello(HelloPayload {
        identity: identity.into(),
        credential: credential.into(),
        capabilities,
    }))
}

/// HEARTBEAT envelope with a fresh correlation id.
pub fn heartbeat() -> Envelope {
    Envelope::fresh(Message::Heartbeat)
}

/// STATUS envelope correlated to the original command.
pub fn status(correlation_id: impl Into<String>, status: StatusPayload) -> Envelope {
    Envelope::new(correlation_id, Message::Status(status))
}
