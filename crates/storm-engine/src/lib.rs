//! Session-scoped orchestration: connection registry, ask/answer correlation,
//! interview fan-out, the approval loop and the workflow that strings them together.

pub mod approval;
pub mod broker;
pub mod error;
pub mod fanout;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod unattended;

pub use approval::{ApprovalEvent, ApprovalHost, ApprovalLoop, ApprovalState};
pub use broker::{CorrelationBroker, PendingAsk, DEFAULT_ASK_TIMEOUT};
pub use error::EngineError;
pub use fanout::{FanOutMode, NoopObserver, UnitEvent, UnitObserver};
pub use orchestrator::{CountTimeoutPolicy, ResearchOrchestrator, WorkflowConfig, WorkflowPhase};
pub use pipeline::{ChatPipeline, InterviewBrief, ResearchPipeline, ScriptedPipeline};
pub use registry::{ConnectionRegistry, SessionListener};
pub use unattended::run_unattended;
