//! Control channel sessions
//!
//! A session is one authenticated WebSocket between the control plane and an
//! execution host. Both sides use the same machinery:
//!
//! - [`handshake`] runs HELLO / HELLO_ACK on the raw socket with a bounded timeout
//! - [`Session`] owns the reader, writer and liveness tasks once authenticated
//! - [`SessionStateMachine`] guards the lifecycle transitions

mod connection;
mod error;
pub mod handshake;
mod state;

pub use connection::{Session, SessionConfig};
pub use error::{CloseReason, SendError, SessionError};
pub use state::{SessionState, SessionStateMachine, StateTransitionError};
