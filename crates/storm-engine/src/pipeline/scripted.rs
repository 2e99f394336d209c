use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use storm_core::models::{Analyst, InterviewResult, ReportParts, ResearchTask};

use super::{usable_sections, InterviewBrief, ResearchPipeline};
use crate::error::EngineError;

const ROLES: [&str; 5] = [
    "Economist",
    "Systems Engineer",
    "Policy Researcher",
    "Industry Practitioner",
    "Historian",
];

/// Deterministic, network-free pipeline.
///
/// Analysts are named `Analyst 1..n`; interviews can be slowed down or made
/// to fail by analyst name.
#[derive(Clone, Debug, Default)]
pub struct ScriptedPipeline {
    delay: Duration,
    failing: HashSet<String>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every interview.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make interviews of the named analyst fail.
    #[must_use]
    pub fn with_failing(mut self, analyst_name: impl Into<String>) -> Self {
        let _ = self.failing.insert(analyst_name.into());
        self
    }
}

#[async_trait]
impl ResearchPipeline for ScriptedPipeline {
    async fn generate_analysts(&self, task: &ResearchTask) -> Result<Vec<Analyst>, EngineError> {
        Ok((1..=task.max_analysts())
            .map(|i| {
                let role = ROLES[(i - 1) % ROLES.len()];
                Analyst::new(
                    format!("Analyst {i}"),
                    role,
                    "Scripted Institute",
                    format!("Examines {} from the {} point of view.", task.topic(), role.to_lowercase()),
                )
            })
            .collect())
    }

    async fn generate_feedback_analyst(
        &self,
        _task: &ResearchTask,
        feedback: &str,
        existing: &[Analyst],
    ) -> Result<Analyst, EngineError> {
        Ok(Analyst::new(
            format!("Analyst {}", existing.len() + 1),
            "Feedback Specialist",
            "Scripted Institute",
            format!("Focuses on: {feedback}"),
        ))
    }

    async fn conduct_interview(
        &self,
        analyst: &Analyst,
        brief: &InterviewBrief,
    ) -> Result<InterviewResult, EngineError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(&analyst.name) {
            return Err(EngineError::Pipeline(format!("scripted failure for {}", analyst.name)));
        }

        let transcript = (1..=brief.max_turns)
            .map(|turn| {
                format!(
                    "{name}: Question {turn} about {topic}?\nExpert: Answer {turn}.",
                    name = analyst.name,
                    topic = brief.topic
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut section = format!(
            "### {} perspective\n\n{} notes on {}.",
            analyst.role, analyst.name, brief.topic
        );
        if let Some(feedback) = &brief.feedback {
            section.push_str(&format!(" Addresses: {feedback}."));
        }
        Ok(InterviewResult::new(analyst.clone(), transcript, section))
    }

    async fn write_report(
        &self,
        topic: &str,
        interviews: &[InterviewResult],
        feedback: Option<&str>,
    ) -> Result<ReportParts, EngineError> {
        let sections = usable_sections(interviews);
        if sections.is_empty() {
            return Err(EngineError::Pipeline("no interview produced usable content".into()));
        }
        let mut conclusion = format!(
            "## Conclusion\n\nSynthesised from {} of {} interviews.",
            sections.len(),
            interviews.len()
        );
        if let Some(feedback) = feedback {
            conclusion.push_str(&format!(" Revised for: {feedback}."));
        }
        Ok(ReportParts::new(
            format!("# {topic}\n\n## Introduction\n\nAn overview of {topic}."),
            format!("## Insights\n\n{}", sections.join("\n\n")),
            conclusion,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brief(feedback: Option<&str>) -> InterviewBrief {
        InterviewBrief {
            topic: "Grid storage".into(),
            max_turns: 2,
            feedback: feedback.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn generates_requested_number_of_analysts() {
        let task = ResearchTask::new("Grid storage").unwrap().with_max_analysts(7).unwrap();
        let analysts = ScriptedPipeline::new().generate_analysts(&task).await.unwrap();
        assert_eq!(analysts.len(), 7);
        assert_eq!(analysts[0].name, "Analyst 1");
        assert_eq!(analysts[5].role, ROLES[0]);
    }

    #[tokio::test]
    async fn feedback_analyst_is_numbered_after_existing() {
        let pipeline = ScriptedPipeline::new();
        let task = ResearchTask::new("X").unwrap();
        let existing = pipeline.generate_analysts(&task).await.unwrap();
        let extra = pipeline
            .generate_feedback_analyst(&task, "add cost analysis", &existing)
            .await
            .unwrap();
        assert_eq!(extra.name, "Analyst 4");
        assert!(extra.description.contains("add cost analysis"));
    }

    #[tokio::test]
    async fn interview_follows_turns_and_feedback() {
        let analyst = Analyst::new("Analyst 1", "Economist", "Org", "d");
        let result = ScriptedPipeline::new()
            .conduct_interview(&analyst, &brief(Some("costs")))
            .await
            .unwrap();
        assert_eq!(result.transcript.lines().count(), 4);
        assert!(result.section.contains("Addresses: costs."));
    }

    #[tokio::test]
    async fn configured_failure() {
        let analyst = Analyst::new("Analyst 2", "Economist", "Org", "d");
        let err = ScriptedPipeline::new()
            .with_failing("Analyst 2")
            .conduct_interview(&analyst, &brief(None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(_)));
    }

    #[tokio::test]
    async fn report_skips_failed_interviews() {
        let a = Analyst::new("A", "R", "O", "D");
        let interviews = vec![
            InterviewResult::new(a.clone(), "t", "good section"),
            InterviewResult::failed(a, "boom"),
        ];
        let parts = ScriptedPipeline::new()
            .write_report("Topic", &interviews, Some("shorter"))
            .await
            .unwrap();
        assert!(parts.main_content.contains("good section"));
        assert!(parts.conclusion.contains("1 of 2"));
        assert!(parts.conclusion.contains("Revised for: shorter."));
    }

    #[tokio::test]
    async fn report_without_content_fails() {
        let a = Analyst::new("A", "R", "O", "D");
        let err = ScriptedPipeline::new()
            .write_report("Topic", &[InterviewResult::failed(a, "x")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(_)));
    }
}
