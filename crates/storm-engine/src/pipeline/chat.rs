use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use storm_core::models::{Analyst, InterviewResult, ReportParts, ResearchTask};
use storm_core::provider::{ChatMessage, ChatProvider, ChatRequest};
use tracing::instrument;

use super::{usable_sections, InterviewBrief, ResearchPipeline};
use crate::error::EngineError;

/// Phrase the interviewer uses to end an interview early.
const CLOSING_PHRASE: &str = "Thank you so much for your help!";
const SECTION_SEPARATOR: &str = "\n\n---\n\n";

const ANALYST_GENERATOR_SYSTEM: &str = "You create diverse expert analyst personas for research \
projects. Reply with JSON only.";

const EXPERT_SYSTEM: &str = "You are a domain expert being interviewed by an analyst. Answer \
precisely, cite concrete facts, figures and sources where you can, and stay on the question asked.";

const SECTION_WRITER_SYSTEM: &str = "You are a technical writer. Turn an interview transcript into a \
concise markdown report section with a `###` title, a short summary and key insights. Do not \
invent facts that are not in the transcript.";

const MAIN_WRITER_SYSTEM: &str = "You write the body of a research report. Synthesise the supplied \
sections into one coherent narrative under a `## Insights` heading. Do not write an introduction \
or conclusion. End with a `## Sources` list when the sections cite sources.";

const INTRO_WRITER_SYSTEM: &str = "You write the introduction of a research report. Start with a \
`#` title, then a `## Introduction` heading and a compelling overview of about 100 words.";

const CONCLUSION_WRITER_SYSTEM: &str = "You write the conclusion of a research report under a \
`## Conclusion` heading, about 100 words, offering synthesis and outlook rather than summary.";

#[derive(Deserialize)]
struct AnalystList {
    analysts: Vec<Analyst>,
}

/// Pipeline backed by a chat model.
pub struct ChatPipeline {
    provider: Arc<dyn ChatProvider>,
}

impl ChatPipeline {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    async fn ask(&self, system: impl Into<String>, user: impl Into<String>) -> Result<String, EngineError> {
        Ok(self.provider.complete(&ChatRequest::prompt(system, user)).await?)
    }

    fn with_feedback(system: &str, feedback: Option<&str>) -> String {
        match feedback {
            Some(feedback) => format!(
                "{system}\n\nThe reader asked for this revision: \"{feedback}\". Make sure the text \
                 addresses it directly."
            ),
            None => system.to_owned(),
        }
    }
}

/// Pull the outermost JSON object out of a model reply that may carry prose or code fences.
fn extract_json<T: DeserializeOwned>(reply: &str) -> Option<T> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

fn interviewer_system(analyst: &Analyst, brief: &InterviewBrief) -> String {
    let mut system = format!(
        "You are an analyst interviewing an expert about: {topic}.\n\n{persona}\n\
         Ask one focused question at a time that draws out specific, non-obvious insights \
         relevant to your perspective. When you are satisfied, end with \"{CLOSING_PHRASE}\"",
        topic = brief.topic,
        persona = analyst.persona(),
    );
    if let Some(feedback) = &brief.feedback {
        system.push_str(&format!(
            "\n\nThe reader of the final report asked for: \"{feedback}\". Steer your questions toward it."
        ));
    }
    system
}

#[async_trait]
impl ResearchPipeline for ChatPipeline {
    #[instrument(skip_all, fields(topic = task.topic(), count = task.max_analysts()))]
    async fn generate_analysts(&self, task: &ResearchTask) -> Result<Vec<Analyst>, EngineError> {
        let prompt = format!(
            "Create {count} expert analysts for the research topic below. Each must bring a \
             different perspective and expertise.\n\nTopic: {topic}\n\nReturn JSON of the form \
             {{\"analysts\": [{{\"name\": \"...\", \"role\": \"...\", \"affiliation\": \"...\", \
             \"description\": \"...\"}}]}}",
            count = task.max_analysts(),
            topic = task.topic(),
        );
        let reply = self.ask(ANALYST_GENERATOR_SYSTEM, prompt).await?;

        match extract_json::<AnalystList>(&reply) {
            Some(list) if !list.analysts.is_empty() => {
                let mut analysts = list.analysts;
                analysts.truncate(task.max_analysts());
                Ok(analysts)
            }
            _ => {
                tracing::warn!(reply_len = reply.len(), "could not parse analysts, using a general researcher");
                Ok(vec![Analyst::new(
                    "General Researcher",
                    "Research Analyst",
                    "Research Institute",
                    format!("General research and analysis of {}", task.topic()),
                )])
            }
        }
    }

    #[instrument(skip_all, fields(topic = task.topic()))]
    async fn generate_feedback_analyst(
        &self,
        task: &ResearchTask,
        feedback: &str,
        existing: &[Analyst],
    ) -> Result<Analyst, EngineError> {
        let roster: String = existing
            .iter()
            .map(|a| format!("- {} ({}): {}\n", a.name, a.role, a.description))
            .collect();
        let prompt = format!(
            "Topic: {topic}\nReader feedback: {feedback}\n\nExisting analysts:\n{roster}\n\
             Create ONE additional analyst who directly addresses the feedback and covers a \
             perspective the existing analysts miss. Return JSON of the form {{\"name\": \"...\", \
             \"role\": \"...\", \"affiliation\": \"...\", \"description\": \"...\"}}",
            topic = task.topic(),
        );
        let reply = self.ask(ANALYST_GENERATOR_SYSTEM, prompt).await?;

        Ok(extract_json::<Analyst>(&reply).unwrap_or_else(|| {
            tracing::warn!("could not parse feedback analyst, using fallback");
            Analyst::new(
                "Feedback Specialist",
                "Feedback Analysis Specialist",
                "Research Institute",
                format!("Focused analysis addressing the feedback: {feedback}"),
            )
        }))
    }

    #[instrument(skip_all, fields(analyst = %analyst.name, max_turns = brief.max_turns))]
    async fn conduct_interview(
        &self,
        analyst: &Analyst,
        brief: &InterviewBrief,
    ) -> Result<InterviewResult, EngineError> {
        let interviewer = interviewer_system(analyst, brief);
        let opening = format!("Please begin the interview about {}.", brief.topic);

        // Each side sees its own turns as assistant turns.
        let mut interviewer_view = vec![ChatMessage::system(interviewer), ChatMessage::user(opening)];
        let mut expert_view = vec![ChatMessage::system(EXPERT_SYSTEM)];
        let mut transcript = Vec::new();

        for _ in 0..brief.max_turns.max(1) {
            let question = self.provider.complete(&ChatRequest::new(interviewer_view.clone())).await?;
            transcript.push(format!("{}: {}", analyst.name, question.trim()));
            if question.contains(CLOSING_PHRASE) {
                break;
            }
            interviewer_view.push(ChatMessage::assistant(question.clone()));
            expert_view.push(ChatMessage::user(question));

            let answer = self.provider.complete(&ChatRequest::new(expert_view.clone())).await?;
            transcript.push(format!("Expert: {}", answer.trim()));
            expert_view.push(ChatMessage::assistant(answer.clone()));
            interviewer_view.push(ChatMessage::user(answer));
        }

        let transcript = transcript.join("\n\n");
        let section = self
            .ask(
                format!("{SECTION_WRITER_SYSTEM}\n\nWrite from this perspective:\n{}", analyst.persona()),
                format!("Write a report section from this interview:\n\n{transcript}"),
            )
            .await?;
        tracing::debug!(transcript_len = transcript.len(), section_len = section.len(), "interview complete");
        Ok(InterviewResult::new(analyst.clone(), transcript, section))
    }

    #[instrument(skip_all, fields(topic = %topic, interviews = interviews.len(), feedback = feedback.is_some()))]
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
        let sections = sections.join(SECTION_SEPARATOR);

        let main = self.ask(
            Self::with_feedback(MAIN_WRITER_SYSTEM, feedback),
            format!("Topic: {topic}\n\nSynthesise these interview sections into an original report body:\n\n{sections}"),
        );
        let intro = self.ask(
            Self::with_feedback(INTRO_WRITER_SYSTEM, feedback),
            format!("Topic: {topic}\n\nWrite the introduction for a report built from these sections:\n\n{sections}"),
        );
        let conclusion = self.ask(
            Self::with_feedback(CONCLUSION_WRITER_SYSTEM, feedback),
            format!("Topic: {topic}\n\nWrite the conclusion for a report built from these sections:\n\n{sections}"),
        );
        let (main_content, introduction, conclusion) = tokio::try_join!(main, intro, conclusion)?;

        Ok(ReportParts {
            introduction,
            main_content,
            conclusion,
        })
    }
}
