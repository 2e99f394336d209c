use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use storm_core::ids::SessionId;
use storm_core::messages::OutboundMessage;
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Notified when a session leaves the registry.
pub trait SessionListener: Send + Sync {
    /// `generation` identifies the registration that ended. A session id that
    /// re-registers gets a new generation.
    fn on_session_closed(&self, session: &SessionId, generation: u64);
}

struct SessionEntry {
    tx: mpsc::Sender<String>,
    created_at: DateTime<Utc>,
    generation: u64,
}

/// Maps each live session to its single outbound channel.
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    listeners: RwLock<Vec<Weak<dyn SessionListener>>>,
    next_generation: AtomicU64,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry. Each session's outbound queue holds at most
    /// `max_send_queue` frames (minimum 1).
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_generation: AtomicU64::new(1),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a session with a fresh bounded channel and return its receiving end.
    pub fn register(&self, session: SessionId) -> Result<mpsc::Receiver<String>, EngineError> {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.register_channel(session, tx)?;
        Ok(rx)
    }

    /// Register a session with a caller-supplied channel.
    /// A live session keeps its existing channel and the new one is rejected.
    pub fn register_channel(&self, session: SessionId, tx: mpsc::Sender<String>) -> Result<(), EngineError> {
        match self.sessions.entry(session) {
            Entry::Occupied(e) => Err(EngineError::SessionAlreadyRegistered(e.key().clone())),
            Entry::Vacant(e) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session_id = %e.key(), generation, "session registered");
                let _ = e.insert(SessionEntry {
                    tx,
                    created_at: Utc::now(),
                    generation,
                });
                Ok(())
            }
        }
    }

    /// Remove a session and tell every listener which registration ended.
    /// Returns false if it was not registered.
    pub fn unregister(&self, session: &SessionId) -> bool {
        let Some((_, entry)) = self.sessions.remove(session) else {
            return false;
        };
        tracing::debug!(session_id = %session, generation = entry.generation, "session unregistered");

        let listeners: Vec<Arc<dyn SessionListener>> =
            self.listeners.read().iter().filter_map(Weak::upgrade).collect();
        for listener in listeners {
            listener.on_session_closed(session, entry.generation);
        }
        true
    }

    /// Subscribe to session teardown. Dead listeners are pruned on each call.
    pub fn add_listener(&self, listener: Weak<dyn SessionListener>) {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    pub fn is_registered(&self, session: &SessionId) -> bool {
        self.sessions.contains_key(session)
    }

    /// Generation of the live registration, if any.
    pub fn generation(&self, session: &SessionId) -> Option<u64> {
        self.sessions.get(session).map(|e| e.generation)
    }

    /// When the live registration was made.
    pub fn created_at(&self, session: &SessionId) -> Option<DateTime<Utc>> {
        self.sessions.get(session).map(|e| e.created_at)
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Ids of every live session, in no particular order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    fn sender(&self, session: &SessionId) -> Result<mpsc::Sender<String>, EngineError> {
        self.sessions
            .get(session)
            .map(|e| e.tx.clone())
            .ok_or_else(|| EngineError::SessionNotFound(session.clone()))
    }

    /// Serialize and queue a message for one session.
    ///
    /// Waits for queue space rather than dropping, so callers that must not
    /// stall wrap this in a deadline.
    pub async fn send(&self, session: &SessionId, message: &OutboundMessage) -> Result<(), EngineError> {
        let text = message.to_json()?;
        self.sender(session)?
            .send(text)
            .await
            .map_err(|_| EngineError::SessionClosed(session.clone()))
    }

    /// Queue progress traffic without waiting. A full queue drops the message.
    /// Returns whether the message was queued.
    pub fn emit(&self, session: &SessionId, message: &OutboundMessage) -> bool {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(session_id = %session, kind = message.tag(), error = %e, "unserializable outbound message");
                return false;
            }
        };
        let tx = match self.sender(session) {
            Ok(tx) => tx,
            Err(_) => {
                tracing::debug!(session_id = %session, kind = message.tag(), "no session, dropping outbound message");
                return false;
            }
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(text)) => {
                tracing::warn!(
                    session_id = %session,
                    kind = message.tag(),
                    msg_len = text.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Unregister every session. Returns how many were removed.
    pub fn shutdown(&self) -> usize {
        let ids = self.session_ids();
        ids.iter().filter(|id| self.unregister(id)).count()
    }
}
