//! Per-session research workflow.
//!
//! ```text
//! Setup -> AskAnalystCount -> GenerateAnalysts -> Interviews -> DraftReport -> ApprovalLoop -> Completed
//!   \__________________________________ any __________________________________________/-> Failed
//! ```

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storm_core::decision::{parse_analyst_count, ApprovalDecision, RewriteMode};
use storm_core::errors::CoreError;
use storm_core::ids::{RunId, SessionId};
use storm_core::messages::{
    AgentActivity, AnalystCountRequest, AskKind, OutboundMessage, ProgressData, ReportApprovalRequest,
};
use storm_core::models::{
    Analyst, InterviewResult, ReportDraft, ReportParts, ReportVersionHistory, ResearchResult, ResearchTask,
    MAX_ANALYSTS, MIN_ANALYSTS,
};
use storm_core::report::{assemble_final_report, ReportPreview};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::approval::{ApprovalHost, ApprovalLoop};
use crate::broker::{CorrelationBroker, DEFAULT_ASK_TIMEOUT};
use crate::error::EngineError;
use crate::fanout::{self, FanOutMode, UnitEvent, UnitObserver};
use crate::pipeline::{InterviewBrief, ResearchPipeline};
use crate::registry::ConnectionRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkflowPhase {
    Setup,
    AskAnalystCount,
    GenerateAnalysts,
    Interviews,
    DraftReport,
    ApprovalLoop,
    Completed,
    Failed,
}

impl WorkflowPhase {
    /// Value of `current_step` in progress events.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::AskAnalystCount => "analyst_count",
            Self::GenerateAnalysts => "analysts",
            Self::Interviews => "interviews",
            Self::DraftReport => "report",
            Self::ApprovalLoop => "approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn ordinal(self) -> u8 {
        match self {
            Self::Setup => 0,
            Self::AskAnalystCount => 1,
            Self::GenerateAnalysts => 2,
            Self::Interviews => 3,
            Self::DraftReport => 4,
            Self::ApprovalLoop => 5,
            Self::Completed => 6,
            Self::Failed => 7,
        }
    }

    /// Phases advance one step at a time; `Failed` is reachable from any live phase.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next.ordinal() == self.ordinal() + 1
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// What to do when the operator never answers the analyst-count question.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountTimeoutPolicy {
    #[default]
    UseDefault,
    Fail,
}

impl CountTimeoutPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UseDefault => "use_default",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for CountTimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CountTimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "use_default" | "default" => Ok(Self::UseDefault),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown count timeout policy '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub ask_timeout: Duration,
    pub min_analysts: usize,
    pub max_analysts: usize,
    pub count_timeout_policy: CountTimeoutPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            ask_timeout: DEFAULT_ASK_TIMEOUT,
            min_analysts: MIN_ANALYSTS,
            max_analysts: MAX_ANALYSTS,
            count_timeout_policy: CountTimeoutPolicy::default(),
        }
    }
}

impl WorkflowConfig {
    /// Configured analyst bounds intersected with what a task accepts.
    pub fn analyst_bounds(&self) -> (usize, usize) {
        let max = self.max_analysts.clamp(MIN_ANALYSTS, MAX_ANALYSTS);
        let min = self.min_analysts.clamp(MIN_ANALYSTS, max);
        (min, max)
    }
}

/// Runs research workflows, at most one per session.
pub struct ResearchOrchestrator {
    broker: Arc<CorrelationBroker>,
    config: WorkflowConfig,
    active: DashMap<SessionId, RunId>,
    shutdown: CancellationToken,
}

impl ResearchOrchestrator {
    pub fn new(broker: Arc<CorrelationBroker>, config: WorkflowConfig) -> Self {
        Self {
            broker,
            config,
            active: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn broker(&self) -> &Arc<CorrelationBroker> {
        &self.broker
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn is_active(&self, session: &SessionId) -> bool {
        self.active.contains_key(session)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Run a workflow to completion on the current task.
    pub async fn run(
        &self,
        session: &SessionId,
        task: ResearchTask,
        pipeline: Arc<dyn ResearchPipeline>,
    ) -> Result<ResearchResult, EngineError> {
        let run_id = self.claim(session)?;
        self.execute(session, run_id, task, pipeline).await
    }

    /// Claim the session and run the workflow on a background task.
    ///
    /// Busy and unknown sessions are rejected before anything is spawned.
    pub fn spawn(
        self: &Arc<Self>,
        session: SessionId,
        task: ResearchTask,
        pipeline: Arc<dyn ResearchPipeline>,
    ) -> Result<(RunId, JoinHandle<Result<ResearchResult, EngineError>>), EngineError> {
        let run_id = self.claim(&session)?;
        let this = Arc::clone(self);
        let id = run_id.clone();
        let handle = tokio::spawn(async move { this.execute(&session, id, task, pipeline).await });
        Ok((run_id, handle))
    }

    /// Abort every running workflow with `Shutdown`.
    pub fn shutdown(&self) {
        tracing::info!(active = self.active.len(), "stopping research workflows");
        self.shutdown.cancel();
    }

    fn claim(&self, session: &SessionId) -> Result<RunId, EngineError> {
        if !self.broker.registry().is_registered(session) {
            return Err(EngineError::SessionNotFound(session.clone()));
        }
        match self.active.entry(session.clone()) {
            Entry::Occupied(_) => Err(EngineError::SessionBusy(session.clone())),
            Entry::Vacant(slot) => {
                let run_id = RunId::new();
                let _ = slot.insert(run_id.clone());
                Ok(run_id)
            }
        }
    }

    #[instrument(skip_all, fields(session_id = %session, run_id = %run_id, topic = %task.topic()))]
    async fn execute(
        &self,
        session: &SessionId,
        run_id: RunId,
        task: ResearchTask,
        pipeline: Arc<dyn ResearchPipeline>,
    ) -> Result<ResearchResult, EngineError> {
        let _active = ActiveRun {
            active: &self.active,
            session: session.clone(),
            run_id: run_id.clone(),
        };
        let mut run = WorkflowRun {
            registry: Arc::clone(self.broker.registry()),
            broker: &self.broker,
            config: &self.config,
            session: session.clone(),
            pipeline,
            task,
            phase: WorkflowPhase::Setup,
            analysts: Vec::new(),
            interviews: Vec::new(),
        };

        let outcome = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(EngineError::Shutdown),
            result = AssertUnwindSafe(run.drive()).catch_unwind() => result.unwrap_or_else(|panic| {
                let message = panic_message(&panic);
                tracing::error!(panic = %message, "research workflow panicked");
                Err(EngineError::Internal(message))
            }),
        };

        match outcome {
            Ok(result) => {
                tracing::info!(
                    analysts = result.analysts.len(),
                    version = result.report.version,
                    "research completed"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, category = e.category(), phase = %run.phase, "research failed");
                run.fail(&e);
                Err(e)
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_owned()
}

/// Clears the session's active slot when its run ends, however it ends.
struct ActiveRun<'a> {
    active: &'a DashMap<SessionId, RunId>,
    session: SessionId,
    run_id: RunId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        let _ = self.active.remove_if(&self.session, |_, id| *id == self.run_id);
    }
}

struct WorkflowRun<'a> {
    registry: Arc<ConnectionRegistry>,
    broker: &'a CorrelationBroker,
    config: &'a WorkflowConfig,
    session: SessionId,
    pipeline: Arc<dyn ResearchPipeline>,
    task: ResearchTask,
    phase: WorkflowPhase,
    analysts: Vec<Analyst>,
    interviews: Vec<InterviewResult>,
}

impl WorkflowRun<'_> {
    async fn drive(&mut self) -> Result<ResearchResult, EngineError> {
        self.emit(
            ProgressData::new(format!("Starting research on '{}'.", self.task.topic()))
                .step(self.phase.tag())
                .activity(
                    AgentActivity::new("research_started", self.task.topic())
                        .with("parallel_interviews", self.task.parallel_interviews())
                        .with("max_interview_turns", self.task.max_interview_turns()),
                ),
        );

        self.enter(WorkflowPhase::AskAnalystCount, "Asking how many analysts to use.")?;
        let count = self.ask_analyst_count().await?;
        self.task = self.task.clone().with_max_analysts(count)?;

        self.enter(
            WorkflowPhase::GenerateAnalysts,
            format!("Generating {count} analyst personas."),
        )?;
        self.analysts = self.generate_analysts(&self.task.clone()).await?;

        self.enter(
            WorkflowPhase::Interviews,
            format!("Interviewing {} analysts.", self.analysts.len()),
        )?;
        let brief = InterviewBrief::from_task(&self.task);
        self.interviews = self.interview(self.analysts.clone(), brief).await?;

        self.enter(WorkflowPhase::DraftReport, "Writing the first report draft.")?;
        let parts = self
            .pipeline
            .write_report(self.task.topic(), &self.interviews, None)
            .await?;

        self.enter(WorkflowPhase::ApprovalLoop, "Report draft ready for review.")?;
        let (draft, history) = ApprovalLoop::new(parts).run(&mut *self).await?;

        let result = ResearchResult {
            topic: self.task.topic().to_owned(),
            analysts: self.analysts.clone(),
            interviews: self.interviews.clone(),
            interview_count: self.interviews.len(),
            final_report: assemble_final_report(&draft.parts),
            report_versions: history.summaries(),
            report: draft,
            completed_at: Utc::now(),
        };
        self.enter(
            WorkflowPhase::Completed,
            format!("Research completed (report version {}).", result.report.version),
        )?;
        let frame = OutboundMessage::Result(Box::new(result.clone()));
        match tokio::time::timeout(self.config.ask_timeout, self.registry.send(&self.session, &frame)).await {
            Ok(sent) => sent.map_err(|e| self.session_lost(e))?,
            Err(_) => {
                return Err(EngineError::Stalled {
                    session: self.session.clone(),
                    after: self.config.ask_timeout,
                })
            }
        }
        Ok(result)
    }

    fn enter(&mut self, next: WorkflowPhase, message: impl Into<String>) -> Result<(), EngineError> {
        if !self.phase.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.phase.to_string(),
                event: next.to_string(),
            });
        }
        tracing::debug!(from = %self.phase, to = %next, "workflow phase");
        self.phase = next;
        self.emit(ProgressData::new(message).step(next.tag()));
        Ok(())
    }

    fn fail(&mut self, error: &EngineError) {
        self.phase = WorkflowPhase::Failed;
        let _ = self
            .registry
            .emit(&self.session, &OutboundMessage::error(error.to_string()));
        self.emit(
            ProgressData::new(format!("Research failed: {error}"))
                .step(WorkflowPhase::Failed.tag())
                .activity(AgentActivity::new("research_failed", error.to_string()).with("category", error.category())),
        );
    }

    fn emit(&self, progress: ProgressData) {
        let _ = self
            .registry
            .emit(&self.session, &OutboundMessage::Progress(progress));
    }

    async fn ask(&self, kind: AskKind, message: &OutboundMessage) -> Result<Value, EngineError> {
        self.broker
            .ask(&self.session, kind, message, Some(self.config.ask_timeout))
            .await
            .map_err(|e| self.session_lost(e))
    }

    /// The session existed when the run started; losing it now means it closed.
    fn session_lost(&self, error: EngineError) -> EngineError {
        match error {
            EngineError::SessionNotFound(session) => EngineError::SessionClosed(session),
            other => other,
        }
    }

    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.registry.is_registered(&self.session) {
            Ok(())
        } else {
            Err(EngineError::SessionClosed(self.session.clone()))
        }
    }

    async fn ask_analyst_count(&mut self) -> Result<usize, EngineError> {
        let (min, max) = self.config.analyst_bounds();
        let default = self.task.max_analysts().clamp(min, max);
        let request = OutboundMessage::AnalystCountRequest(AnalystCountRequest {
            default_count: default,
            message: format!(
                "How many analysts should research '{}'? Choose {min}-{max} (default {default}).",
                self.task.topic()
            ),
        });

        let answer = match self.ask(AskKind::AnalystCount, &request).await {
            Ok(payload) => payload,
            Err(EngineError::Timeout { after, .. })
                if self.config.count_timeout_policy == CountTimeoutPolicy::UseDefault =>
            {
                self.emit(
                    ProgressData::new(format!(
                        "No analyst count received within {}s; using {default}.",
                        after.as_secs()
                    ))
                    .step(self.phase.tag()),
                );
                return Ok(default);
            }
            Err(e) => return Err(e),
        };

        let count = match parse_analyst_count(&answer) {
            Ok(Some(requested)) => {
                let count = requested.clamp(min, max);
                if count != requested {
                    tracing::info!(requested, count, "analyst count clamped");
                }
                count
            }
            Ok(None) => default,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable analyst count, using default");
                default
            }
        };
        self.emit(
            ProgressData::new(format!("Using {count} analysts."))
                .step(self.phase.tag())
                .sub_activity(format!("analyst count: {count}")),
        );
        Ok(count)
    }

    async fn generate_analysts(&self, task: &ResearchTask) -> Result<Vec<Analyst>, EngineError> {
        self.emit(
            ProgressData::new("Generating analysts.")
                .step(WorkflowPhase::GenerateAnalysts.tag())
                .activity(AgentActivity::new("generating_analysts", task.topic()).with("count", task.max_analysts())),
        );
        let analysts = self.pipeline.generate_analysts(task).await?;
        let names: Vec<Value> = analysts.iter().map(|a| Value::from(a.label())).collect();
        self.emit(
            ProgressData::new(format!("Created {} analysts.", analysts.len()))
                .step(WorkflowPhase::GenerateAnalysts.tag())
                .activity(AgentActivity::new("analysts_created", analysts.len().to_string()).with("analysts", names)),
        );
        Ok(analysts)
    }

    async fn interview(
        &self,
        analysts: Vec<Analyst>,
        brief: InterviewBrief,
    ) -> Result<Vec<InterviewResult>, EngineError> {
        let mode = FanOutMode::from_parallel(self.task.parallel_interviews());
        let action = match mode {
            FanOutMode::Parallel => "parallel_interviews_started",
            FanOutMode::Sequential => "sequential_interviews_started",
        };
        self.emit(
            ProgressData::new(format!("Starting {} interviews.", analysts.len()))
                .step(WorkflowPhase::Interviews.tag())
                .activity(AgentActivity::new(action, analysts.len().to_string())),
        );

        let pipeline = Arc::clone(&self.pipeline);
        let work = move |analyst: Analyst| {
            let pipeline = Arc::clone(&pipeline);
            let brief = brief.clone();
            async move { pipeline.conduct_interview(&analyst, &brief).await }
        };
        let observer = Arc::new(ProgressObserver {
            registry: Arc::clone(&self.registry),
            session: self.session.clone(),
        });
        let results = fanout::run(analysts, mode, work, observer).await;

        // Units always finish; their output is useless once the operator has gone.
        self.ensure_connected()?;

        let failed = results.iter().filter(|r| r.is_error()).count();
        self.emit(
            ProgressData::new(format!(
                "Completed {} of {} interviews.",
                results.len() - failed,
                results.len()
            ))
            .step(WorkflowPhase::Interviews.tag())
            .activity(AgentActivity::new("interviews_completed", results.len().to_string()).with("failed", failed)),
        );
        Ok(results)
    }
}

#[async_trait]
impl ApprovalHost for WorkflowRun<'_> {
    async fn request_decision(
        &mut self,
        draft: &ReportDraft,
        history: &ReportVersionHistory,
    ) -> Result<ApprovalDecision, EngineError> {
        let preview = ReportPreview::from_draft(draft).with_history(history.summaries());
        let request = OutboundMessage::ReportApprovalRequest(ReportApprovalRequest::new(self.task.topic(), preview));
        let payload = self.ask(AskKind::ReportApproval, &request).await?;
        ApprovalDecision::from_payload(&payload).map_err(|e| match e {
            CoreError::MalformedDecision(reason) => EngineError::MalformedDecision(reason),
            other => EngineError::Core(other),
        })
    }

    async fn rework(&mut self, mode: &RewriteMode) -> Result<ReportParts, EngineError> {
        let topic = self.task.topic().to_owned();
        match mode {
            RewriteMode::Complete => {
                let count = self.analysts.len().clamp(MIN_ANALYSTS, MAX_ANALYSTS);
                self.notify(
                    ProgressData::new("Rewriting the report from scratch.").activity(
                        AgentActivity::new("rewriting_report", "complete").with("analysts", count),
                    ),
                )
                .await;
                let task = ResearchTask::new(topic.as_str())?
                    .with_max_analysts(count)?
                    .with_max_interview_turns(self.task.max_interview_turns())?
                    .with_parallel_interviews(self.task.parallel_interviews());
                self.analysts = self.generate_analysts(&task).await?;
                self.interviews = self
                    .interview(self.analysts.clone(), InterviewBrief::from_task(&task))
                    .await?;
                self.task = task;
                Ok(self.pipeline.write_report(&topic, &self.interviews, None).await?)
            }
            RewriteMode::Feedback(feedback) if !feedback.is_empty() => {
                self.notify(
                    ProgressData::new(format!("Rewriting the report with feedback: {feedback}")).activity(
                        AgentActivity::new("rewriting_report", "feedback").with("feedback", feedback.as_str()),
                    ),
                )
                .await;
                let revised = self.task.with_feedback(feedback.as_str());
                let extra = self
                    .pipeline
                    .generate_feedback_analyst(&revised, feedback, &self.analysts)
                    .await?;
                self.emit(
                    ProgressData::new(format!("Added analyst {}.", extra.label()))
                        .step(self.phase.tag())
                        .activity(AgentActivity::new("analysts_created", "1").with("analysts", vec![extra.label()])),
                );
                self.analysts.push(extra);
                self.interviews = self
                    .interview(self.analysts.clone(), InterviewBrief::from_task(&revised))
                    .await?;
                Ok(self
                    .pipeline
                    .write_report(&topic, &self.interviews, Some(feedback.as_str()))
                    .await?)
            }
            RewriteMode::Feedback(_) => {
                self.notify(
                    ProgressData::new("Redrafting the report from the existing interviews.")
                        .activity(AgentActivity::new("rewriting_report", "redraft")),
                )
                .await;
                Ok(self.pipeline.write_report(&topic, &self.interviews, None).await?)
            }
        }
    }

    async fn notify(&mut self, progress: ProgressData) {
        let progress = match progress.current_step {
            Some(_) => progress,
            None => progress.step(self.phase.tag()),
        };
        self.emit(progress);
    }
}

/// Turns fan-out unit events into progress messages for the session.
struct ProgressObserver {
    registry: Arc<ConnectionRegistry>,
    session: SessionId,
}

#[async_trait]
impl UnitObserver for ProgressObserver {
    async fn on_unit(&self, event: UnitEvent) {
        let progress = match event {
            UnitEvent::Started { index, total, analyst } => {
                ProgressData::new(format!("Interviewing {analyst}."))
                    .sub_activity(format!("Interview {}/{total}: {analyst}", index + 1))
                    .activity(
                        AgentActivity::new("conducting_interview", analyst)
                            .with("index", index + 1)
                            .with("total", total),
                    )
            }
            UnitEvent::Finished {
                index,
                total,
                analyst,
                ok,
            } => ProgressData::new(if ok {
                format!("Finished interviewing {analyst}.")
            } else {
                format!("Interview with {analyst} failed.")
            })
            .sub_activity(format!("Interview {}/{total}: {analyst}", index + 1))
            .activity(
                AgentActivity::new("interview_completed", analyst)
                    .with("index", index + 1)
                    .with("total", total)
                    .with("ok", ok),
            ),
        };
        let _ = self.registry.emit(
            &self.session,
            &OutboundMessage::Progress(progress.step(WorkflowPhase::Interviews.tag())),
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::pipeline::ScriptedPipeline;

    fn setup(config: WorkflowConfig) -> (Arc<ResearchOrchestrator>, Arc<CorrelationBroker>) {
        let registry = Arc::new(ConnectionRegistry::new(256));
        let broker = CorrelationBroker::new(registry, config.ask_timeout);
        (Arc::new(ResearchOrchestrator::new(Arc::clone(&broker), config)), broker)
    }

    type Answer = Box<dyn Fn(&Value) -> Option<(AskKind, Value)> + Send>;

    /// Plays the operator: answers asks according to `answer` and returns every frame seen.
    fn operator(
        broker: Arc<CorrelationBroker>,
        session: SessionId,
        mut rx: mpsc::Receiver<String>,
        answer: Answer,
    ) -> JoinHandle<Vec<Value>> {
        tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                let msg: Value = serde_json::from_str(&frame).unwrap();
                if let Some((kind, payload)) = answer(&msg) {
                    assert!(broker.deliver(&session, kind, payload));
                }
                let done = matches!(msg["type"].as_str(), Some("result" | "error"));
                frames.push(msg);
                if done {
                    break;
                }
            }
            frames
        })
    }

    fn task(topic: &str, analysts: usize) -> ResearchTask {
        ResearchTask::new(topic)
            .unwrap()
            .with_max_analysts(analysts)
            .unwrap()
            .with_max_interview_turns(2)
            .unwrap()
    }

    fn first_steps(frames: &[Value]) -> Vec<String> {
        let mut steps: Vec<String> = Vec::new();
        for frame in frames {
            if let Some(step) = frame["data"]["current_step"].as_str() {
                if !steps.iter().any(|s| s == step) {
                    steps.push(step.to_owned());
                }
            }
        }
        steps
    }

    #[tokio::test]
    async fn count_then_feedback_rewrite_then_approve() {
        let (orchestrator, broker) = setup(WorkflowConfig::default());
        let sid = SessionId::from_raw("s1");
        let rx = broker.registry().register(sid.clone()).unwrap();

        let client = operator(
            Arc::clone(&broker),
            sid.clone(),
            rx,
            Box::new(|msg| match msg["type"].as_str()? {
                "analyst_count_request" => {
                    assert_eq!(msg["data"]["default_count"], 2);
                    Some((AskKind::AnalystCount, json!({"count": 4})))
                }
                "report_approval_request" => match msg["data"]["preview"]["version"].as_u64()? {
                    1 => Some((
                        AskKind::ReportApproval,
                        json!({"action": "rewrite", "rewrite_type": "feedback", "feedback": "add cost analysis"}),
                    )),
                    _ => {
                        assert_eq!(msg["data"]["preview"]["history"].as_array().unwrap().len(), 2);
                        Some((AskKind::ReportApproval, json!({"action": "approve"})))
                    }
                },
                _ => None,
            }),
        );

        let result = orchestrator
            .run(&sid, task("X", 2), Arc::new(ScriptedPipeline::new()))
            .await
            .unwrap();

        assert_eq!(result.analysts.len(), 5);
        assert_eq!(result.analysts[4].role, "Feedback Specialist");
        assert_eq!(result.interviews.len(), 5);
        assert_eq!(result.interview_count, 5);
        assert_eq!(result.report.version, 2);
        assert_eq!(result.report_versions.len(), 2);
        assert!(result.report.parts.conclusion.contains("add cost analysis"));
        assert!(result.interviews[0].section.contains("Addresses: add cost analysis."));
        assert!(result.final_report.contains("## Main Content"));
        assert!(!orchestrator.is_active(&sid));

        let frames = client.await.unwrap();
        assert_eq!(frames.last().unwrap()["type"], "result");
        assert_eq!(frames.last().unwrap()["data"]["report"]["version"], 2);
        assert_eq!(
            first_steps(&frames),
            vec!["setup", "analyst_count", "analysts", "interviews", "report", "approval", "completed"]
        );
        let interview_events = frames
            .iter()
            .filter(|f| f["data"]["agent_activity"]["action"] == "interview_completed")
            .count();
        assert_eq!(interview_events, 4 + 5);
    }

    #[tokio::test]
    async fn complete_rewrite_and_view_full() {
        let (orchestrator, broker) = setup(WorkflowConfig::default());
        let sid = SessionId::from_raw("s1");
        let rx = broker.registry().register(sid.clone()).unwrap();
        let viewed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = Arc::clone(&viewed);

        let client = operator(
            Arc::clone(&broker),
            sid.clone(),
            rx,
            Box::new(move |msg| {
                if msg["data"]["agent_activity"]["action"] == "viewing_full_report" {
                    assert!(msg["data"]["agent_activity"]["full_report"].as_str().unwrap().contains("## Main Content"));
                    seen.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                match msg["type"].as_str()? {
                    "analyst_count_request" => Some((AskKind::AnalystCount, json!({}))),
                    "report_approval_request" => {
                        let action = match msg["data"]["preview"]["version"].as_u64()? {
                            1 if !seen.load(std::sync::atomic::Ordering::SeqCst) => json!({"action": "view_full"}),
                            1 => json!({"action": "rewrite", "rewrite_type": "complete"}),
                            _ => json!({"action": "approve"}),
                        };
                        Some((AskKind::ReportApproval, action))
                    }
                    _ => None,
                }
            }),
        );

        let result = orchestrator
            .run(
                &sid,
                task("Y", 3).with_parallel_interviews(false),
                Arc::new(ScriptedPipeline::new()),
            )
            .await
            .unwrap();
        assert!(viewed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(result.report.version, 2);
        assert_eq!(result.analysts.len(), 3);
        assert!(!result.report.parts.conclusion.contains("Revised for"));
        let frames = client.await.unwrap();
        assert!(frames
            .iter()
            .any(|f| f["data"]["agent_activity"]["action"] == "sequential_interviews_started"));
    }

    #[tokio::test]
    async fn count_is_clamped_to_bounds() {
        let config = WorkflowConfig {
            max_analysts: 4,
            ..WorkflowConfig::default()
        };
        let (orchestrator, broker) = setup(config);
        let sid = SessionId::from_raw("s1");
        let rx = broker.registry().register(sid.clone()).unwrap();
        let _client = operator(
            Arc::clone(&broker),
            sid.clone(),
            rx,
            Box::new(|msg| match msg["type"].as_str()? {
                "analyst_count_request" => Some((AskKind::AnalystCount, json!({"count": 9}))),
                "report_approval_request" => Some((AskKind::ReportApproval, json!({"action": "approve"}))),
                _ => None,
            }),
        );
        let result = orchestrator
            .run(&sid, task("Z", 2), Arc::new(ScriptedPipeline::new()))
            .await
            .unwrap();
        assert_eq!(result.analysts.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn count_timeout_uses_default() {
        let config = WorkflowConfig {
            ask_timeout: Duration::from_secs(5),
            ..WorkflowConfig::default()
        };
        let (orchestrator, broker) = setup(config);
        let sid = SessionId::from_raw("s1");
        let rx = broker.registry().register(sid.clone()).unwrap();
        let client = operator(
            Arc::clone(&broker),
            sid.clone(),
            rx,
            Box::new(|msg| match msg["type"].as_str()? {
                "report_approval_request" => Some((AskKind::ReportApproval, json!({"action": "approve"}))),
                _ => None,
            }),
        );

        let result = orchestrator
            .run(&sid, task("Quiet operator", 3), Arc::new(ScriptedPipeline::new()))
            .await
            .unwrap();
        assert_eq!(result.analysts.len(), 3);
        let frames = client.await.unwrap();
        assert!(frames
            .iter()
            .any(|f| f["data"]["message"].as_str().is_some_and(|m| m.contains("No analyst count received"))));
    }

    #[tokio::test(start_paused = true)]
    async fn count_timeout_can_fail_the_run() {
        let config = WorkflowConfig {
            ask_timeout: Duration::from_secs(5),
            count_timeout_policy: CountTimeoutPolicy::Fail,
            ..WorkflowConfig::default()
        };
        let (orchestrator, broker) = setup(config);
        let sid = SessionId::from_raw("s1");
        let rx = broker.registry().register(sid.clone()).unwrap();
        let client = operator(Arc::clone(&broker), sid.clone(), rx, Box::new(|_| None));

        let err = orchestrator
            .run(&sid, task("Quiet operator", 3), Arc::new(ScriptedPipeline::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { kind: AskKind::AnalystCount, .. }));

        let frames = client.await.unwrap();
        let last = frames.last().unwrap();
        assert_eq!(last["type"], "error");
        assert!(last["data"]["error"].as_str().unwrap().contains("analyst_count"));
    }

    #[tokio::test]
    async fn disconnect_aborts_only_that_session() {
        let (orchestrator, broker) = setup(WorkflowConfig::default());
        let gone = SessionId::from_raw("gone");
        let stays = SessionId::from_raw("stays");
        let rx_gone = broker.registry().register(gone.clone()).unwrap();
        let rx_stays = broker.registry().register(stays.clone()).unwrap();

        let registry = Arc::clone(broker.registry());
        let closing = gone.clone();
        let _dropper = operator(
            Arc::clone(&broker),
            gone.clone(),
            rx_gone,
            Box::new(move |msg| {
                if msg["type"] == "analyst_count_request" {
                    let _ = registry.unregister(&closing);
                }
                None
            }),
        );
        let _steady = operator(
            Arc::clone(&broker),
            stays.clone(),
            rx_stays,
            Box::new(|msg| match msg["type"].as_str()? {
                "analyst_count_request" => Some((AskKind::AnalystCount, json!({"count": 1}))),
                "report_approval_request" => Some((AskKind::ReportApproval, json!({"action": "approve"}))),
                _ => None,
            }),
        );

        let pipeline: Arc<dyn ResearchPipeline> = Arc::new(ScriptedPipeline::new());
        let (gone_result, stays_result) = tokio::join!(
            orchestrator.run(&gone, task("A", 2), Arc::clone(&pipeline)),
            orchestrator.run(&stays, task("B", 2), Arc::clone(&pipeline)),
        );
        assert!(matches!(gone_result.unwrap_err(), EngineError::SessionClosed(_)));
        assert_eq!(stays_result.unwrap().analysts.len(), 1);
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let (orchestrator, _broker) = setup(WorkflowConfig::default());
        let err = orchestrator
            .run(&SessionId::from_raw("nobody"), task("A", 1), Arc::new(ScriptedPipeline::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn busy_session_is_rejected_and_shutdown_stops_run() {
        let (orchestrator, broker) = setup(WorkflowConfig::default());
        let sid = SessionId::from_raw("s1");
        let _rx = broker.registry().register(sid.clone()).unwrap();
        let pipeline: Arc<dyn ResearchPipeline> = Arc::new(ScriptedPipeline::new());

        let (_run_id, handle) = orchestrator
            .spawn(sid.clone(), task("A", 1), Arc::clone(&pipeline))
            .unwrap();
        assert!(orchestrator.is_active(&sid));
        let err = orchestrator.spawn(sid.clone(), task("A", 1), pipeline).unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy(_)));

        orchestrator.shutdown();
        assert!(matches!(handle.await.unwrap().unwrap_err(), EngineError::Shutdown));
        assert!(!orchestrator.is_active(&sid));
    }

    /// Scripted content, except that drafting the report panics.
    struct PanickingWriter(ScriptedPipeline);

    #[async_trait]
    impl ResearchPipeline for PanickingWriter {
        async fn generate_analysts(&self, task: &ResearchTask) -> Result<Vec<Analyst>, EngineError> {
            self.0.generate_analysts(task).await
        }

        async fn generate_feedback_analyst(
            &self,
            task: &ResearchTask,
            feedback: &str,
            existing: &[Analyst],
        ) -> Result<Analyst, EngineError> {
            self.0.generate_feedback_analyst(task, feedback, existing).await
        }

        async fn conduct_interview(
            &self,
            analyst: &Analyst,
            brief: &InterviewBrief,
        ) -> Result<InterviewResult, EngineError> {
            self.0.conduct_interview(analyst, brief).await
        }

        async fn write_report(
            &self,
            _topic: &str,
            _interviews: &[InterviewResult],
            _feedback: Option<&str>,
        ) -> Result<ReportParts, EngineError> {
            panic!("report writer exploded")
        }
    }

    #[tokio::test]
    async fn panicking_phase_fails_the_run_with_an_error_event() {
        let (orchestrator, broker) = setup(WorkflowConfig::default());
        let sid = SessionId::from_raw("s1");
        let rx = broker.registry().register(sid.clone()).unwrap();
        let client = operator(
            Arc::clone(&broker),
            sid.clone(),
            rx,
            Box::new(|msg| match msg["type"].as_str()? {
                "analyst_count_request" => Some((AskKind::AnalystCount, json!({"count": 1}))),
                _ => None,
            }),
        );

        let (_run_id, handle) = orchestrator
            .spawn(sid.clone(), task("Boom", 1), Arc::new(PanickingWriter(ScriptedPipeline::new())))
            .unwrap();
        let err = handle.await.expect("panic escaped the workflow").unwrap_err();
        assert!(matches!(err, EngineError::Internal(ref m) if m.contains("report writer exploded")));
        assert_eq!(err.category(), "internal");
        assert!(!orchestrator.is_active(&sid));

        let frames = client.await.unwrap();
        let last = frames.last().unwrap();
        assert_eq!(last["type"], "error");
        assert!(last["data"]["error"].as_str().unwrap().contains("report writer exploded"));
        assert!(frames.iter().any(|f| f["data"]["current_step"] == "report"));
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_progress() {
        let registry = Arc::new(ConnectionRegistry::new(1));
        let config = WorkflowConfig {
            ask_timeout: Duration::from_millis(50),
            count_timeout_policy: CountTimeoutPolicy::Fail,
            ..WorkflowConfig::default()
        };
        let broker = CorrelationBroker::new(Arc::clone(&registry), config.ask_timeout);
        let orchestrator = ResearchOrchestrator::new(Arc::clone(&broker), config);
        let sid = SessionId::from_raw("s1");
        let _rx = registry.register(sid.clone()).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.run(&sid, task("Stalled", 1), Arc::new(ScriptedPipeline::new())),
        )
        .await
        .expect("workflow blocked on a full queue")
        .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { kind: AskKind::AnalystCount, .. }));
    }

    #[test]
    fn phase_transitions() {
        use WorkflowPhase::*;
        assert!(Setup.can_transition_to(AskAnalystCount));
        assert!(!Setup.can_transition_to(Interviews));
        assert!(Interviews.can_transition_to(Failed));
        assert!(ApprovalLoop.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Setup));
    }

    #[test]
    fn count_policy_parsing() {
        assert_eq!("fail".parse::<CountTimeoutPolicy>().unwrap(), CountTimeoutPolicy::Fail);
        assert_eq!("USE_DEFAULT".parse::<CountTimeoutPolicy>().unwrap(), CountTimeoutPolicy::UseDefault);
        assert!("maybe".parse::<CountTimeoutPolicy>().is_err());
        assert_eq!(serde_json::to_value(CountTimeoutPolicy::UseDefault).unwrap(), json!("use_default"));
    }

    #[test]
    fn analyst_bounds_stay_within_task_limits() {
        let config = WorkflowConfig {
            min_analysts: 0,
            max_analysts: 50,
            ..WorkflowConfig::default()
        };
        assert_eq!(config.analyst_bounds(), (MIN_ANALYSTS, MAX_ANALYSTS));
        let config = WorkflowConfig {
            min_analysts: 8,
            max_analysts: 4,
            ..WorkflowConfig::default()
        };
        assert_eq!(config.analyst_bounds(), (4, 4));
    }
}
