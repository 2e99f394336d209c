//! Request/response correlation between a workflow and its remote operator.
//!
//! A workflow calls [`CorrelationBroker::ask`] with a question; the broker
//! records a one-shot slot keyed by `(session, kind)`, pushes the question
//! through the [`ConnectionRegistry`] and suspends until the transport hands
//! a matching answer to [`CorrelationBroker::deliver`], the deadline passes,
//! or the session is torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use storm_core::ids::SessionId;
use storm_core::messages::{AskKind, InboundEnvelope, OutboundMessage};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::EngineError;
use crate::registry::{ConnectionRegistry, SessionListener};

pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(300);

type PendingKey = (SessionId, AskKind);
type Reply = Result<Value, EngineError>;

struct PendingRequest {
    ticket: u64,
    generation: u64,
    tx: oneshot::Sender<Reply>,
    deadline: Instant,
}

/// Snapshot of one outstanding ask.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAsk {
    pub session: SessionId,
    pub kind: AskKind,
    pub remaining: Duration,
}

pub struct CorrelationBroker {
    registry: Arc<ConnectionRegistry>,
    pending: DashMap<PendingKey, PendingRequest>,
    next_ticket: AtomicU64,
    default_timeout: Duration,
}

/// Clears the slot if the ask future is dropped before it resolves.
struct SlotGuard<'a> {
    pending: &'a DashMap<PendingKey, PendingRequest>,
    key: PendingKey,
    ticket: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let ticket = self.ticket;
        let _ = self.pending.remove_if(&self.key, |_, p| p.ticket == ticket);
    }
}

impl CorrelationBroker {
    /// Create a broker subscribed to session teardown on `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, default_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let listener: Weak<dyn SessionListener> = weak.clone();
            registry.add_listener(listener);
            Self {
                registry,
                pending: DashMap::new(),
                next_ticket: AtomicU64::new(1),
                default_timeout,
            }
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deadline used when `ask` is called without one.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `payload` to the session and wait for the matching answer.
    ///
    /// Fails with `DuplicateAsk` if the same `(session, kind)` is already
    /// waiting, `SessionNotFound` if the session is unknown, `Timeout` after
    /// `timeout` (or the broker default), and `SessionClosed` on teardown.
    /// The deadline covers queueing the question as well as the answer, so a
    /// client that stops reading cannot hold the caller past it.
    pub async fn ask(
        &self,
        session: &SessionId,
        kind: AskKind,
        payload: &OutboundMessage,
        timeout: Option<Duration>,
    ) -> Result<Value, EngineError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let generation = self
            .registry
            .generation(session)
            .ok_or_else(|| EngineError::SessionNotFound(session.clone()))?;
        let key = (session.clone(), kind);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::DuplicateAsk {
                    session: session.clone(),
                    kind,
                })
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(PendingRequest {
                    ticket,
                    generation,
                    tx,
                    deadline,
                });
            }
        }
        let _guard = SlotGuard {
            pending: &self.pending,
            key,
            ticket,
        };

        let exchange = async {
            self.registry.send(session, payload).await?;
            tracing::debug!(session_id = %session, kind = %kind, ?timeout, "awaiting operator answer");
            rx.await.map_err(|_| EngineError::SessionClosed(session.clone()))?
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::info!(session_id = %session, kind = %kind, ?timeout, "operator answer timed out");
                Err(EngineError::Timeout { kind, after: timeout })
            }
        }
    }

    /// Resolve the waiter for `(session, kind)`. Returns false when nobody was waiting.
    pub fn deliver(&self, session: &SessionId, kind: AskKind, payload: Value) -> bool {
        match self.pending.remove(&(session.clone(), kind)) {
            Some((_, request)) => request.tx.send(Ok(payload)).is_ok(),
            None => {
                tracing::debug!(session_id = %session, kind = %kind, "no pending ask, dropping answer");
                false
            }
        }
    }

    /// Decode a raw inbound frame and deliver it.
    pub fn deliver_message(&self, session: &SessionId, text: &str) -> Result<bool, EngineError> {
        let envelope = InboundEnvelope::parse(text)?;
        match envelope.ask_kind() {
            Some(kind) => Ok(self.deliver(session, kind, envelope.data)),
            None => {
                tracing::debug!(session_id = %session, msg_type = %envelope.kind, "ignoring unknown message type");
                Ok(false)
            }
        }
    }

    /// Fail every outstanding ask of `session` with `SessionClosed`.
    pub fn cancel_session(&self, session: &SessionId) -> usize {
        self.cancel_where(session, |_| true)
    }

    /// Fail the asks issued while registration `generation` of `session` was live.
    /// Asks made by a later registration of the same id are left alone.
    pub fn cancel_generation(&self, session: &SessionId, generation: u64) -> usize {
        self.cancel_where(session, |request| request.generation == generation)
    }

    fn cancel_where(&self, session: &SessionId, predicate: impl Fn(&PendingRequest) -> bool) -> usize {
        let keys: Vec<PendingKey> = self
            .pending
            .iter()
            .filter(|e| &e.key().0 == session && predicate(e.value()))
            .map(|e| e.key().clone())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, request)) = self.pending.remove_if(&key, |_, request| predicate(request)) {
                let _ = request.tx.send(Err(EngineError::SessionClosed(session.clone())));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(session_id = %session, cancelled, "cancelled pending asks");
        }
        cancelled
    }

    /// Number of outstanding asks across all sessions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, session: &SessionId, kind: AskKind) -> bool {
        self.pending.contains_key(&(session.clone(), kind))
    }

    /// Outstanding asks for one session with the time left on each.
    pub fn pending_for(&self, session: &SessionId) -> Vec<PendingAsk> {
        let now = Instant::now();
        self.pending
            .iter()
            .filter(|e| &e.key().0 == session)
            .map(|e| PendingAsk {
                session: e.key().0.clone(),
                kind: e.key().1,
                remaining: e.value().deadline.saturating_duration_since(now),
            })
            .collect()
    }
}

impl SessionListener for CorrelationBroker {
    fn on_session_closed(&self, session: &SessionId, generation: u64) {
        let _ = self.cancel_generation(session, generation);
    }
}
