use std::time::Duration;

use storm_core::errors::{CoreError, ProviderError};
use storm_core::ids::SessionId;
use storm_core::messages::AskKind;

#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    /// No answer arrived before the deadline.
    #[error("no {kind} answer within {after:?}")]
    Timeout { kind: AskKind, after: Duration },

    /// The session went away while something was waiting on it.
    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already registered: {0}")]
    SessionAlreadyRegistered(SessionId),

    /// A second ask for the same session and kind while one is pending.
    #[error("a {kind} request is already pending for session {session}")]
    DuplicateAsk { session: SessionId, kind: AskKind },

    /// A research workflow is already running for this session.
    #[error("session busy: {0}")]
    SessionBusy(SessionId),

    #[error("unit {index} ({analyst}) failed: {reason}")]
    UnitFailure {
        index: usize,
        analyst: String,
        reason: String,
    },

    #[error("malformed decision: {0}")]
    MalformedDecision(String),

    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The session stopped draining its outbound queue.
    #[error("session {session} stopped reading for {after:?}")]
    Stalled { session: SessionId, after: Duration },

    /// A workflow phase panicked.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("engine shut down")]
    Shutdown,
}

impl EngineError {
    /// Whether the workflow can carry on locally after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Timeout { .. } | Self::UnitFailure { .. } | Self::MalformedDecision(_) => true,
            Self::SessionClosed(_)
            | Self::SessionNotFound(_)
            | Self::SessionAlreadyRegistered(_)
            | Self::DuplicateAsk { .. }
            | Self::SessionBusy(_)
            | Self::InvalidTransition { .. }
            | Self::Pipeline(_)
            | Self::Core(_)
            | Self::Serialization(_)
            | Self::Stalled { .. }
            | Self::Internal(_)
            | Self::Shutdown => false,
        }
    }

    /// Error category string for event emission.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::SessionClosed(_) => "session_closed",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionAlreadyRegistered(_) => "session_already_registered",
            Self::DuplicateAsk { .. } => "duplicate_ask",
            Self::SessionBusy(_) => "session_busy",
            Self::UnitFailure { .. } => "unit_failure",
            Self::MalformedDecision(_) => "malformed_decision",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Pipeline(_) => "pipeline",
            Self::Provider(_) => "provider",
            Self::Core(_) => "core",
            Self::Serialization(_) => "serialization",
            Self::Stalled { .. } => "stalled",
            Self::Internal(_) => "internal",
            Self::Shutdown => "shutdown",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
