//! Control channel wire protocol
//!
//! JSON envelopes over WebSocket text frames, shared by the control plane and
//! the execution host.

mod envelope;
mod messages;

pub use envelope::*;
pub use messages::*;
