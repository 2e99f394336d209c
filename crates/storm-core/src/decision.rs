//! Typed operator answers decoded from inbound payloads.

use serde::Deserialize;
use serde_json::Value;

use crate::errors::CoreError;

/// How a rewrite should be produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RewriteMode {
    /// Regenerate analysts, rerun interviews and redraft.
    Complete,
    /// Incorporate operator feedback. Empty text means a plain redraft.
    Feedback(String),
}

/// The operator's answer to a report approval request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Rewrite(RewriteMode),
    ViewFull,
}

#[derive(Deserialize)]
struct RawDecision {
    action: Option<String>,
    rewrite_type: Option<String>,
    feedback: Option<String>,
}

impl ApprovalDecision {
    pub fn from_payload(data: &Value) -> Result<Self, CoreError> {
        let raw = RawDecision::deserialize(data)
            .map_err(|e| CoreError::MalformedDecision(e.to_string()))?;

        match raw.action.as_deref() {
            Some("approve") => Ok(Self::Approve),
            Some("view_full") => Ok(Self::ViewFull),
            Some("rewrite") => match raw.rewrite_type.as_deref().unwrap_or("feedback") {
                "complete" => Ok(Self::Rewrite(RewriteMode::Complete)),
                "feedback" => Ok(Self::Rewrite(RewriteMode::Feedback(
                    raw.feedback.unwrap_or_default().trim().to_owned(),
                ))),
                other => Err(CoreError::MalformedDecision(format!(
                    "unknown rewrite_type '{other}'"
                ))),
            },
            Some(other) => Err(CoreError::MalformedDecision(format!("unknown action '{other}'"))),
            None => Err(CoreError::MalformedDecision("missing action".into())),
        }
    }

    /// Wire name of the action, for logs.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Rewrite(_) => "rewrite",
            Self::ViewFull => "view_full",
        }
    }
}

/// Decode an `analyst_count` answer. A missing count means "use the default".
pub fn parse_analyst_count(data: &Value) -> Result<Option<usize>, CoreError> {
    match data.get("count") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| CoreError::MalformedDecision(format!("count must be a positive integer, got {v}"))),
    }
}
