//! Session State Machine
//!
//! Defines the valid state transitions for a control channel session:
//!
//! ```text
//! ┌────────────┐  await_hello()  ┌───────────────┐  authenticated()  ┌───────────────┐
//! │ Connecting │ ──────────────► │ AwaitingHello │ ────────────────► │ Authenticated │
//! └─────┬──────┘                 └───────┬───────┘                   └───────┬───────┘
//!       │                                │                                   │ activate()
//!       │                                │                                   ▼
//!       │        begin_close()           │                           ┌───────────────┐
//!       └────────────────────────────────┴──────────────────────────►│    Closing    │◄── Active
//!                                                                    └───────┬───────┘
//!                                                                            │ finish_close()
//!                                                                            ▼
//!                                                                    ┌───────────────┐
//!                                                                    │    Closed     │
//!                                                                    └───────────────┘
//! ```
//!
//! Both sides walk the same path: the control plane waits for HELLO, the host
//! waits for HELLO_ACK.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport established, nothing exchanged yet
    #[default]
    Connecting,
    /// Waiting for the peer's side of the handshake
    AwaitingHello,
    /// Credential accepted, not yet serving traffic
    Authenticated,
    /// Exchanging envelopes
    Active,
    /// Teardown in progress
    Closing,
    /// All resources released
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::AwaitingHello => write!(f, "awaiting_hello"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// State machine for session lifecycle management
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    transition_count: u32,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create a new state machine in Connecting state
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            transition_count: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get total number of state transitions
    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    /// Start waiting for the handshake message
    pub fn await_hello(&mut self) -> Result<(), StateTransitionError> {
        self.expect(SessionState::Connecting, SessionState::AwaitingHello)
    }

    /// Handshake accepted
    pub fn authenticated(&mut self) -> Result<(), StateTransitionError> {
        self.expect(SessionState::AwaitingHello, SessionState::Authenticated)
    }

    /// Start serving traffic
    pub fn activate(&mut self) -> Result<(), StateTransitionError> {
        self.expect(SessionState::Authenticated, SessionState::Active)
    }

    /// Begin teardown. Allowed from any state before Closing.
    pub fn begin_close(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Closing | SessionState::Closed => {
                Err(StateTransitionError::InvalidTransition {
                    from: self.state,
                    to: SessionState::Closing,
                })
            }
            _ => {
                self.transition_to(SessionState::Closing);
                Ok(())
            }
        }
    }

    /// Teardown finished
    pub fn finish_close(&mut self) -> Result<(), StateTransitionError> {
        self.expect(SessionState::Closing, SessionState::Closed)
    }

    /// Check if the session is serving traffic
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Check if teardown has started or finished
    pub fn is_closing(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    fn expect(&mut self, from: SessionState, to: SessionState) -> Result<(), StateTransitionError> {
        if self.state == from {
            self.transition_to(to);
            Ok(())
        } else {
            Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn transition_to(&mut self, new_state: SessionState) {
        tracing::debug!(
            "[session] State transition: {} -> {} (count: {})",
            self.state,
            new_state,
            self.transition_count + 1
        );
        self.state = new_state;
        self.transition_count += 1;
    }
}

/// Error type for invalid state transitions
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}
