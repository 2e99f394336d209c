pub mod decision;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod models;
pub mod provider;
pub mod report;

pub use decision::{ApprovalDecision, RewriteMode};
pub use errors::{CoreError, ProviderError};
pub use ids::{RunId, SessionId};
pub use messages::{AskKind, InboundEnvelope, OutboundMessage};
pub use models::{Analyst, InterviewResult, ReportDraft, ReportParts, ReportVersionHistory, ResearchResult, ResearchTask};
pub use provider::{ChatMessage, ChatProvider, ChatRequest, ChatRole};
