//! Content-producing collaborators of the workflow.
//!
//! The orchestrator only sequences these calls; how analysts, interviews and
//! report parts are actually produced lives behind [`ResearchPipeline`].

mod chat;
mod scripted;

pub use chat::ChatPipeline;
pub use scripted::ScriptedPipeline;

use async_trait::async_trait;
use storm_core::models::{Analyst, InterviewResult, ReportParts, ResearchTask};

use crate::error::EngineError;

/// What an interviewer needs to know beyond its own persona.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterviewBrief {
    pub topic: String,
    pub max_turns: usize,
    pub feedback: Option<String>,
}

impl InterviewBrief {
    pub fn from_task(task: &ResearchTask) -> Self {
        Self {
            topic: task.topic().to_owned(),
            max_turns: task.max_interview_turns(),
            feedback: task.feedback().map(str::to_owned),
        }
    }
}

#[async_trait]
pub trait ResearchPipeline: Send + Sync {
    /// Produce `task.max_analysts()` analysts for the topic.
    async fn generate_analysts(&self, task: &ResearchTask) -> Result<Vec<Analyst>, EngineError>;

    /// Produce one extra analyst focused on operator feedback.
    async fn generate_feedback_analyst(
        &self,
        task: &ResearchTask,
        feedback: &str,
        existing: &[Analyst],
    ) -> Result<Analyst, EngineError>;

    async fn conduct_interview(
        &self,
        analyst: &Analyst,
        brief: &InterviewBrief,
    ) -> Result<InterviewResult, EngineError>;

    /// Write the three report parts from the successful interviews.
    async fn write_report(
        &self,
        topic: &str,
        interviews: &[InterviewResult],
        feedback: Option<&str>,
    ) -> Result<ReportParts, EngineError>;
}

/// Section text of every interview that produced one.
pub(crate) fn usable_sections(interviews: &[InterviewResult]) -> Vec<&str> {
    interviews
        .iter()
        .filter(|i| !i.is_error() && !i.section.trim().is_empty())
        .map(|i| i.section.as_str())
        .collect()
}
