//! Wire envelope exchanged with the operator: `{ "type": <tag>, "data": <object> }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::CoreError;
use crate::models::ResearchResult;
use crate::report::ReportPreview;

pub const APPROVAL_OPTIONS: [&str; 3] = ["approve", "rewrite", "view_full"];

/// Server → client messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    Progress(ProgressData),
    AnalystCountRequest(AnalystCountRequest),
    ReportApprovalRequest(ReportApprovalRequest),
    Result(Box<ResearchResult>),
    Error(ErrorData),
}

impl OutboundMessage {
    pub fn progress(message: impl Into<String>) -> Self {
        Self::Progress(ProgressData::new(message))
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error(ErrorData {
            error: error.into(),
        })
    }

    /// The envelope `type` tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::AnalystCountRequest(_) => "analyst_count_request",
            Self::ReportApprovalRequest(_) => "report_approval_request",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_activity: Option<AgentActivity>,
}

impl ProgressData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    #[must_use]
    pub fn sub_activity(mut self, sub_activity: impl Into<String>) -> Self {
        self.sub_activity = Some(sub_activity.into());
        self
    }

    #[must_use]
    pub fn activity(mut self, activity: AgentActivity) -> Self {
        self.agent_activity = Some(activity);
        self
    }
}

/// Structured description of what the workflow is doing right now.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentActivity {
    pub action: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentActivity {
    pub fn new(action: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            details: details.into(),
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        let _ = self.extra.insert(key.to_owned(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalystCountRequest {
    pub default_count: usize,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportApprovalRequest {
    pub topic: String,
    pub preview: ReportPreview,
    pub options: Vec<String>,
}

impl ReportApprovalRequest {
    pub fn new(topic: impl Into<String>, preview: ReportPreview) -> Self {
        Self {
            topic: topic.into(),
            preview,
            options: APPROVAL_OPTIONS.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub error: String,
}

/// The two questions the workflow can put to the operator.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    AnalystCount,
    ReportApproval,
}

impl AskKind {
    /// Tag of the outbound request.
    pub fn request_tag(self) -> &'static str {
        match self {
            Self::AnalystCount => "analyst_count_request",
            Self::ReportApproval => "report_approval_request",
        }
    }

    /// Tag the operator's answer carries.
    pub fn response_tag(self) -> &'static str {
        match self {
            Self::AnalystCount => "analyst_count",
            Self::ReportApproval => "report_approval",
        }
    }

    pub fn from_response_tag(tag: &str) -> Option<Self> {
        match tag {
            "analyst_count" => Some(Self::AnalystCount),
            "report_approval" => Some(Self::ReportApproval),
            _ => None,
        }
    }
}

impl std::fmt::Display for AskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.response_tag())
    }
}

/// Client → server message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|e| CoreError::MalformedEnvelope(e.to_string()))
    }

    pub fn ask_kind(&self) -> Option<AskKind> {
        AskKind::from_response_tag(&self.kind)
    }
}
