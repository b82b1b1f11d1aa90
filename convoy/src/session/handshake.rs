//! HELLO / HELLO_ACK handshake
//!
//! Runs on the raw socket before a [`Session`](super::Session) exists, so a
//! peer that fails it is never started, activated, or registered.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::error::SessionError;
use super::state::SessionStateMachine;
use crate::auth::Authenticator;
use crate::protocol::{
    Direction, Envelope, HelloAckPayload, HelloPayload, Message, MessageType, ProtocolError,
};

/// Time allowed to deliver a rejection before dropping the socket.
const REJECT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Accepted HELLO.
#[derive(Debug, Clone)]
pub struct AcceptedHello {
    pub correlation_id: String,
    pub identity: String,
    pub capabilities: Vec<String>,
}

/// Control-plane side: wait for HELLO and verify the credential.
///
/// On success the machine is `Authenticated` and the caller owes the peer a
/// HELLO_ACK (accepted or rejected, depending on registration). On failure a
/// rejection has been sent best-effort and the socket closed.
pub async fn accept<S>(
    ws: &mut WebSocketStream<S>,
    machine: &mut SessionStateMachine,
    authenticator: &dyn Authenticator,
    timeout: Duration,
) -> Result<AcceptedHello, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = machine.await_hello();

    let envelope = match tokio::time::timeout(timeout, next_envelope(ws, Direction::Upstream)).await
    {
        Ok(Ok(envelope)) => envelope,
        Ok(Err(e)) => {
            close_quietly(ws).await;
            return Err(e);
        }
        Err(_) => {
            warn!("[handshake] No HELLO within {:?}", timeout);
            close_quietly(ws).await;
            return Err(SessionError::HandshakeTimeout(timeout));
        }
    };

    let correlation_id = envelope.correlation_id.clone();
    let hello: HelloPayload = match envelope.message {
        Message::Hello(hello) => hello,
        other => {
            let kind = other.message_type();
            warn!("[handshake] Expected HELLO, got {}", kind);
            close_quietly(ws).await;
            return Err(ProtocolError::WrongDirection(kind).into());
        }
    };

    if let Err(reason) = authenticator.verify(&hello.identity, &hello.credential) {
        info!("[handshake] Rejected '{}': {}", hello.identity, reason);
        reject(ws, &correlation_id, &reason).await;
        return Err(SessionError::Authentication(reason));
    }

    let _ = machine.authenticated();
    debug!("[handshake] '{}' authenticated", hello.identity);

    Ok(AcceptedHello {
        correlation_id,
        identity: hello.identity,
        capabilities: hello.capabilities,
    })
}

/// Host side: send HELLO and wait for HELLO_ACK.
pub async fn initiate<S>(
    ws: &mut WebSocketStream<S>,
    machine: &mut SessionStateMachine,
    hello: Envelope,
    timeout: Duration,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if hello.message_type() != MessageType::Hello {
        return Err(ProtocolError::WrongDirection(hello.message_type()).into());
    }

    let _ = machine.await_hello();

    let exchange = async {
        ws.send(WsMessage::Text(hello.encode()?)).await?;
        next_envelope(ws, Direction::Downstream).await
    };

    let envelope = match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result?,
        Err(_) => {
            close_quietly(ws).await;
            return Err(SessionError::HandshakeTimeout(timeout));
        }
    };

    match envelope.message {
        Message::HelloAck(HelloAckPayload { accepted: true, .. }) => {
            let _ = machine.authenticated();
            Ok(())
        }
        Message::HelloAck(HelloAckPayload { reason, .. }) => {
            close_quietly(ws).await;
            Err(SessionError::Authentication(
                reason.unwrap_or_else(|| "rejected".to_string()),
            ))
        }
        other => {
            close_quietly(ws).await;
            Err(ProtocolError::WrongDirection(other.message_type()).into())
        }
    }
}

/// Send HELLO_ACK{accepted:false} and close.
pub async fn reject<S>(ws: &mut WebSocketStream<S>, correlation_id: &str, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ack = Envelope::new(
        correlation_id,
        Message::HelloAck(HelloAckPayload::rejected(reason)),
    );
    if let Ok(text) = ack.encode() {
        let _ = tokio::time::timeout(REJECT_SEND_TIMEOUT, ws.send(WsMessage::Text(text))).await;
    }
    close_quietly(ws).await;
}

async fn close_quietly<S>(ws: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tokio::time::timeout(REJECT_SEND_TIMEOUT, ws.close(None)).await;
}

/// Read frames until one envelope arrives. Control frames are skipped.
async fn next_envelope<S>(
    ws: &mut WebSocketStream<S>,
    direction: Direction,
) -> Result<Envelope, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return Ok(Envelope::decode_from(&text, direction)?);
            }
            Some(Ok(WsMessage::Binary(_))) => {
                return Err(ProtocolError::Malformed("binary frame".to_string()).into());
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(SessionError::Transport("connection closed during handshake".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
