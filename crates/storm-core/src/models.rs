use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::report::{truncate_chars, VersionSummary};

pub const MIN_ANALYSTS: usize = 1;
pub const MAX_ANALYSTS: usize = 10;
pub const MIN_INTERVIEW_TURNS: usize = 1;
pub const MAX_INTERVIEW_TURNS: usize = 10;
pub const DEFAULT_ANALYSTS: usize = 3;
pub const DEFAULT_INTERVIEW_TURNS: usize = 3;

/// A generated research persona. Opaque to the orchestration layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analyst {
    pub name: String,
    pub role: String,
    pub affiliation: String,
    pub description: String,
}

impl Analyst {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        affiliation: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            affiliation: affiliation.into(),
            description: description.into(),
        }
    }

    /// Prompt-ready description of who this analyst is.
    pub fn persona(&self) -> String {
        format!(
            "Name: {}\nRole: {}\nAffiliation: {}\nDescription: {}\n",
            self.name, self.role, self.affiliation, self.description
        )
    }

    /// Short label used in progress events.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.role)
    }
}

/// Immutable description of one research run. Revision rounds derive new values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResearchTask {
    topic: String,
    max_analysts: usize,
    max_interview_turns: usize,
    parallel_interviews: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<String>,
}

impl ResearchTask {
    pub fn new(topic: impl Into<String>) -> Result<Self, CoreError> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(CoreError::InvalidTask("topic must not be empty".into()));
        }
        Ok(Self {
            topic,
            max_analysts: DEFAULT_ANALYSTS,
            max_interview_turns: DEFAULT_INTERVIEW_TURNS,
            parallel_interviews: true,
            feedback: None,
        })
    }

    pub fn with_max_analysts(mut self, count: usize) -> Result<Self, CoreError> {
        check_range("max_analysts", count, MIN_ANALYSTS, MAX_ANALYSTS)?;
        self.max_analysts = count;
        Ok(self)
    }

    pub fn with_max_interview_turns(mut self, turns: usize) -> Result<Self, CoreError> {
        check_range("max_interview_turns", turns, MIN_INTERVIEW_TURNS, MAX_INTERVIEW_TURNS)?;
        self.max_interview_turns = turns;
        Ok(self)
    }

    #[must_use]
    pub fn with_parallel_interviews(mut self, parallel: bool) -> Self {
        self.parallel_interviews = parallel;
        self
    }

    /// Copy of this task carrying operator feedback. Blank feedback clears it.
    #[must_use]
    pub fn with_feedback(&self, feedback: impl Into<String>) -> Self {
        let feedback = feedback.into();
        Self {
            feedback: (!feedback.trim().is_empty()).then_some(feedback),
            ..self.clone()
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn max_analysts(&self) -> usize {
        self.max_analysts
    }

    pub fn max_interview_turns(&self) -> usize {
        self.max_interview_turns
    }

    pub fn parallel_interviews(&self) -> bool {
        self.parallel_interviews
    }

    pub fn feedback(&self) -> Option<&str> {
        self.feedback.as_deref()
    }
}

fn check_range(field: &str, value: usize, min: usize, max: usize) -> Result<(), CoreError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::InvalidTask(format!(
            "{field} must be between {min} and {max}, got {value}"
        )))
    }
}

/// Outcome of interviewing one analyst. Failed units keep their slot with an error marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewResult {
    pub analyst: Analyst,
    pub transcript: String,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InterviewResult {
    pub fn new(analyst: Analyst, transcript: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            analyst,
            transcript: transcript.into(),
            section: section.into(),
            error: None,
        }
    }

    /// Placeholder for a unit that failed.
    pub fn failed(analyst: Analyst, error: impl Into<String>) -> Self {
        Self {
            analyst,
            transcript: String::new(),
            section: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The three named parts of a report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportParts {
    pub introduction: String,
    pub main_content: String,
    pub conclusion: String,
}

impl ReportParts {
    pub fn new(
        introduction: impl Into<String>,
        main_content: impl Into<String>,
        conclusion: impl Into<String>,
    ) -> Self {
        Self {
            introduction: introduction.into(),
            main_content: main_content.into(),
            conclusion: conclusion.into(),
        }
    }

    /// Character count across all parts.
    pub fn total_length(&self) -> usize {
        self.introduction.chars().count()
            + self.main_content.chars().count()
            + self.conclusion.chars().count()
    }
}

/// One numbered version of the report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDraft {
    pub version: u32,
    pub parts: ReportParts,
    pub created_at: DateTime<Utc>,
}

/// Append-only list of drafts. Versions are contiguous from 1.
#[derive(Clone, Debug, Default)]
pub struct ReportVersionHistory {
    drafts: Vec<ReportDraft>,
}

impl ReportVersionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `parts` as the next version and return the stored draft.
    pub fn push(&mut self, parts: ReportParts) -> &ReportDraft {
        let version = self.drafts.len() as u32 + 1;
        self.drafts.push(ReportDraft {
            version,
            parts,
            created_at: Utc::now(),
        });
        &self.drafts[self.drafts.len() - 1]
    }

    pub fn current(&self) -> Option<&ReportDraft> {
        self.drafts.last()
    }

    pub fn current_version(&self) -> u32 {
        self.current().map_or(0, |d| d.version)
    }

    pub fn get(&self, version: u32) -> Option<&ReportDraft> {
        let idx = usize::try_from(version).ok()?.checked_sub(1)?;
        self.drafts.get(idx)
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReportDraft> {
        self.drafts.iter()
    }

    pub fn summaries(&self) -> Vec<VersionSummary> {
        self.drafts
            .iter()
            .map(|d| VersionSummary {
                version: d.version,
                total_length: d.parts.total_length(),
                introduction_preview: truncate_chars(&d.parts.introduction, 100),
                created_at: d.created_at,
            })
            .collect()
    }
}

/// Final output of an approved run. Built exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResearchResult {
    pub topic: String,
    pub analysts: Vec<Analyst>,
    pub interviews: Vec<InterviewResult>,
    pub interview_count: usize,
    pub report: ReportDraft,
    pub final_report: String,
    pub report_versions: Vec<VersionSummary>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyst(name: &str) -> Analyst {
        Analyst::new(name, "Economist", "Institute", "Looks at costs")
    }

    #[test]
    fn task_defaults() {
        let task = ResearchTask::new("Grid storage").unwrap();
        assert_eq!(task.topic(), "Grid storage");
        assert_eq!(task.max_analysts(), 3);
        assert_eq!(task.max_interview_turns(), 3);
        assert!(task.parallel_interviews());
        assert!(task.feedback().is_none());
    }

    #[test]
    fn task_rejects_blank_topic() {
        assert!(matches!(ResearchTask::new("   "), Err(CoreError::InvalidTask(_))));
    }

    #[test]
    fn task_bounds_enforced() {
        let task = ResearchTask::new("X").unwrap();
        assert!(task.clone().with_max_analysts(0).is_err());
        assert!(task.clone().with_max_analysts(11).is_err());
        assert_eq!(task.clone().with_max_analysts(10).unwrap().max_analysts(), 10);
        assert!(task.clone().with_max_interview_turns(0).is_err());
        assert!(task.with_max_interview_turns(11).is_err());
    }

    #[test]
    fn with_feedback_leaves_original_untouched() {
        let task = ResearchTask::new("X").unwrap();
        let revised = task.with_feedback("add cost analysis");
        assert_eq!(revised.feedback(), Some("add cost analysis"));
        assert!(task.feedback().is_none());
        assert!(task.with_feedback("  ").feedback().is_none());
    }

    #[test]
    fn persona_lists_all_fields() {
        let p = analyst("Ada").persona();
        assert!(p.contains("Name: Ada"));
        assert!(p.contains("Role: Economist"));
        assert!(p.contains("Affiliation: Institute"));
        assert!(p.contains("Description: Looks at costs"));
    }

    #[test]
    fn failed_interview_keeps_analyst() {
        let r = InterviewResult::failed(analyst("Bo"), "model unavailable");
        assert!(r.is_error());
        assert_eq!(r.analyst.name, "Bo");
        assert!(r.section.is_empty());
    }

    #[test]
    fn history_versions_are_contiguous() {
        let mut history = ReportVersionHistory::new();
        assert_eq!(history.current_version(), 0);
        for i in 1..=4 {
            let draft = history.push(ReportParts::new(format!("intro {i}"), "main", "end"));
            assert_eq!(draft.version, i);
        }
        assert_eq!(history.len(), 4);
        assert_eq!(history.current_version(), 4);
        assert_eq!(history.get(2).unwrap().parts.introduction, "intro 2");
        assert!(history.get(0).is_none());
        assert!(history.get(5).is_none());
    }

    #[test]
    fn total_length_counts_chars() {
        let parts = ReportParts::new("héllo", "wörld", "!");
        assert_eq!(parts.total_length(), 11);
    }

    #[test]
    fn summaries_follow_history() {
        let mut history = ReportVersionHistory::new();
        let _ = history.push(ReportParts::new("a".repeat(150), "m", "c"));
        let _ = history.push(ReportParts::new("short", "m", "c"));
        let summaries = history.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].introduction_preview.chars().count(), 100);
        assert_eq!(summaries[1].version, 2);
        assert_eq!(summaries[1].total_length, 7);
    }
}
