//! Connection Registry - authoritative map of identity → live session
//!
//! Lookups vastly outnumber writes, so the map is a sharded `DashMap`; each
//! entry is swapped atomically and a lookup never observes a half-registered
//! or half-removed session.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::session::{CloseReason, Session};

/// Buffer for connect/disconnect notifications per subscriber.
const EVENT_CAPACITY: usize = 1024;

/// Connect / disconnect notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected { identity: String },
    Disconnected { identity: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Agent '{0}' already has a live session")]
    AlreadyConnected(String),
}

/// Manages all live agent sessions
pub struct ConnectionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: DashMap::new(),
            events,
        }
    }

    /// Bind a session to its identity.
    ///
    /// Fails if the identity already has a session that is not closing. A
    /// closing leftover is replaced (and reported as disconnected).
    ///
    /// Events are sent while the entry is locked, so subscribers see them in
    /// the order the map changed.
    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let identity = session.identity().to_string();
        match self.sessions.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closing() {
                    return Err(RegistryError::AlreadyConnected(identity));
                }
                entry.insert(session);
                debug!("[registry] Replaced closing session for {}", identity);
                self.emit(RegistryEvent::Disconnected {
                    identity: identity.clone(),
                });
                self.emit(RegistryEvent::Connected {
                    identity: identity.clone(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(session);
                self.emit(RegistryEvent::Connected {
                    identity: identity.clone(),
                });
            }
        }
        info!("[registry] Registered {}", identity);
        Ok(())
    }

    /// Remove whatever session is bound to `identity`. Idempotent.
    pub fn unregister(&self, identity: &str) -> Option<Arc<Session>> {
        let Entry::Occupied(entry) = self.sessions.entry(identity.to_string()) else {
            return None;
        };
        let session = entry.remove();
        self.emit(RegistryEvent::Disconnected {
            identity: identity.to_string(),
        });
        info!("[registry] Unregistered {}", identity);
        Some(session)
    }

    /// Remove `session` only if it is still the one bound to its identity.
    ///
    /// A session tearing down late must not evict its replacement.
    pub fn unregister_session(&self, session: &Arc<Session>) -> bool {
        let identity = session.identity();
        match self.sessions.entry(identity.to_string()) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), session) => {
                entry.remove();
                self.emit(RegistryEvent::Disconnected {
                    identity: identity.to_string(),
                });
            }
            _ => return false,
        }
        info!("[registry] Unregistered {}", identity);
        true
    }

    /// Live session for `identity`. Absence is not an error.
    ///
    /// A session is only visible once ACTIVE, so no command can overtake the
    /// HELLO_ACK of a freshly registered session.
    pub fn lookup(&self, identity: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(identity).map(|r| r.value().clone())?;
        if session.is_live() {
            Some(session)
        } else {
            None
        }
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.lookup(identity).is_some()
    }

    /// Subscribe to connect/disconnect notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Get the number of registered sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close and unregister every session (for shutdown)
    pub fn close_all(&self, reason: CloseReason) {
        let identities: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for identity in identities {
            if let Some(session) = self.unregister(&identity) {
                session.close(reason.clone());
            }
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
