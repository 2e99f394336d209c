//! Operator-less research: the analyst count comes from the task and the
//! first draft is accepted as-is.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use storm_core::models::{Analyst, ReportVersionHistory, ResearchResult, ResearchTask};
use storm_core::report::assemble_final_report;
use tracing::instrument;

use crate::error::EngineError;
use crate::fanout::{self, FanOutMode, UnitEvent, UnitObserver};
use crate::pipeline::{InterviewBrief, ResearchPipeline};

/// Logs interview progress instead of sending it anywhere.
struct LogObserver;

#[async_trait]
impl UnitObserver for LogObserver {
    async fn on_unit(&self, event: UnitEvent) {
        match event {
            UnitEvent::Started { index, total, analyst } => {
                tracing::info!(unit = index + 1, total, %analyst, "interview started");
            }
            UnitEvent::Finished {
                index,
                total,
                analyst,
                ok,
            } => {
                tracing::info!(unit = index + 1, total, %analyst, ok, "interview finished");
            }
        }
    }
}

/// Generate analysts, interview them and draft the report once.
///
/// Failed interviews become placeholders exactly as in the interactive
/// workflow; the report is written from whatever succeeded.
#[instrument(skip_all, fields(topic = %task.topic(), analysts = task.max_analysts()))]
pub async fn run_unattended(
    task: ResearchTask,
    pipeline: Arc<dyn ResearchPipeline>,
) -> Result<ResearchResult, EngineError> {
    let analysts = pipeline.generate_analysts(&task).await?;
    tracing::info!(count = analysts.len(), "analysts generated");

    let brief = InterviewBrief::from_task(&task);
    let worker = Arc::clone(&pipeline);
    let work = move |analyst: Analyst| {
        let pipeline = Arc::clone(&worker);
        let brief = brief.clone();
        async move { pipeline.conduct_interview(&analyst, &brief).await }
    };
    let interviews = fanout::run(
        analysts.clone(),
        FanOutMode::from_parallel(task.parallel_interviews()),
        work,
        Arc::new(LogObserver),
    )
    .await;
    let failed = interviews.iter().filter(|i| i.is_error()).count();
    if failed > 0 {
        tracing::warn!(failed, total = interviews.len(), "some interviews failed");
    }

    let parts = pipeline.write_report(task.topic(), &interviews, None).await?;
    let mut history = ReportVersionHistory::new();
    let draft = history.push(parts).clone();

    Ok(ResearchResult {
        topic: task.topic().to_owned(),
        analysts,
        interview_count: interviews.len(),
        interviews,
        final_report: assemble_final_report(&draft.parts),
        report_versions: history.summaries(),
        report: draft,
        completed_at: Utc::now(),
    })
}
