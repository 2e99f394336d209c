//! Report previews and final-report assembly.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{ReportDraft, ReportParts};

pub const INTRODUCTION_PREVIEW_CHARS: usize = 200;
pub const MAIN_CONTENT_PREVIEW_CHARS: usize = 300;
pub const CONCLUSION_PREVIEW_CHARS: usize = 200;

static ANY_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,2} \S").unwrap());
static CONCLUSION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^#{1,3}\s*conclusion").unwrap());

/// First `max` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}

/// Compact description of one historical version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: u32,
    pub total_length: usize,
    pub introduction_preview: String,
    pub created_at: DateTime<Utc>,
}

/// What the operator sees when asked to approve a draft.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPreview {
    pub version: u32,
    pub introduction_preview: String,
    pub main_content_preview: String,
    pub conclusion_preview: String,
    pub total_length: usize,
    /// Every part of the draft in full. Decoding also accepts `full_report`.
    #[serde(alias = "full_report")]
    pub full_draft: ReportParts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<VersionSummary>,
}

impl ReportPreview {
    pub fn from_draft(draft: &ReportDraft) -> Self {
        let parts = &draft.parts;
        Self {
            version: draft.version,
            introduction_preview: truncate_chars(&parts.introduction, INTRODUCTION_PREVIEW_CHARS),
            main_content_preview: truncate_chars(&parts.main_content, MAIN_CONTENT_PREVIEW_CHARS),
            conclusion_preview: truncate_chars(&parts.conclusion, CONCLUSION_PREVIEW_CHARS),
            total_length: parts.total_length(),
            full_draft: parts.clone(),
            history: Vec::new(),
        }
    }

    /// Attach version summaries; a single-version history is left out.
    #[must_use]
    pub fn with_history(mut self, history: Vec<VersionSummary>) -> Self {
        if history.len() > 1 {
            self.history = history;
        }
        self
    }
}

/// Join the report parts into one markdown document.
///
/// A main section that is already a complete document is returned as-is.
/// Otherwise a leading `## Insights` heading is dropped and any trailing
/// references or sources block is moved after the conclusion.
pub fn assemble_final_report(parts: &ReportParts) -> String {
    let main = parts.main_content.trim();
    if ANY_HEADING.is_match(main) && CONCLUSION_HEADING.is_match(main) {
        return main.to_owned();
    }

    let mut main = main
        .strip_prefix("## Insights")
        .map_or(main, str::trim_start)
        .to_owned();

    let mut trailer = None;
    for heading in ["## References", "## Sources"] {
        let marker = format!("\n{heading}\n");
        if let Some(idx) = main.find(&marker) {
            let block = main[idx + marker.len()..].to_owned();
            main.truncate(idx);
            trailer = Some((heading, block));
            break;
        }
    }

    let mut report = format!(
        "{}\n\n---\n\n## Main Content\n\n{}\n\n---\n\n{}",
        parts.introduction.trim(),
        main.trim_end(),
        parts.conclusion.trim()
    );
    if let Some((heading, block)) = trailer {
        report.push_str("\n\n");
        report.push_str(heading);
        report.push('\n');
        report.push_str(block.trim_end());
    }
    report
}
