//! Versioned report approval loop.
//!
//! ```text
//! Presenting(v) --approve--------> Approved(v)
//! Presenting(v) --rewrite--------> Reworking(v) --done--> Presenting(v+1)
//! Presenting(v) --view_full------> Viewing(v)   --shown-> Presenting(v)
//! Presenting(v) --timeout/garbled-> Presenting(v)
//! ```

use std::fmt;

use async_trait::async_trait;
use storm_core::decision::{ApprovalDecision, RewriteMode};
use storm_core::messages::{AgentActivity, ProgressData};
use storm_core::models::{ReportDraft, ReportParts, ReportVersionHistory};
use storm_core::report::assemble_final_report;

use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalState {
    Presenting(u32),
    Reworking(u32),
    Viewing(u32),
    Approved(u32),
}

impl ApprovalState {
    pub fn version(self) -> u32 {
        match self {
            Self::Presenting(v) | Self::Reworking(v) | Self::Viewing(v) | Self::Approved(v) => v,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved(_))
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Presenting(_) => "presenting",
            Self::Reworking(_) => "reworking",
            Self::Viewing(_) => "viewing",
            Self::Approved(_) => "approved",
        }
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tag(), self.version())
    }
}

/// Inputs that move the loop.
#[derive(Clone, Debug, PartialEq)]
pub enum ApprovalEvent {
    Decision(ApprovalDecision),
    /// The operator did not answer in time.
    TimedOut,
    /// The answer could not be decoded.
    Malformed,
    /// A rewrite produced new parts.
    Reworked(ReportParts),
    /// The full report has been shown.
    Shown,
}

impl ApprovalEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Decision(d) => d.action(),
            Self::TimedOut => "timed_out",
            Self::Malformed => "malformed",
            Self::Reworked(_) => "reworked",
            Self::Shown => "shown",
        }
    }
}

/// Side of the loop that talks to the operator and produces rewrites.
#[async_trait]
pub trait ApprovalHost: Send {
    /// Present `draft` and wait for a decision.
    /// `Timeout` and `MalformedDecision` errors keep the loop where it is.
    async fn request_decision(
        &mut self,
        draft: &ReportDraft,
        history: &ReportVersionHistory,
    ) -> Result<ApprovalDecision, EngineError>;

    /// Produce the parts of the next version.
    async fn rework(&mut self, mode: &RewriteMode) -> Result<ReportParts, EngineError>;

    async fn notify(&mut self, progress: ProgressData);
}

/// The approval state machine plus its version history.
pub struct ApprovalLoop {
    state: ApprovalState,
    history: ReportVersionHistory,
    rewrite: Option<RewriteMode>,
}

impl ApprovalLoop {
    /// Start at `Presenting(1)` with `initial` as version 1.
    pub fn new(initial: ReportParts) -> Self {
        let mut history = ReportVersionHistory::new();
        let _ = history.push(initial);
        Self {
            state: ApprovalState::Presenting(1),
            history,
            rewrite: None,
        }
    }

    pub fn state(&self) -> ApprovalState {
        self.state
    }

    pub fn history(&self) -> &ReportVersionHistory {
        &self.history
    }

    /// Apply one event. Events that make no sense in the current state are rejected
    /// and leave the loop untouched.
    pub fn apply(&mut self, event: ApprovalEvent) -> Result<ApprovalState, EngineError> {
        use ApprovalState::{Approved, Presenting, Reworking, Viewing};

        let next = match (self.state, event) {
            (Presenting(v), ApprovalEvent::Decision(ApprovalDecision::Approve)) => Approved(v),
            (Presenting(v), ApprovalEvent::Decision(ApprovalDecision::Rewrite(mode))) => {
                self.rewrite = Some(mode);
                Reworking(v)
            }
            (Presenting(v), ApprovalEvent::Decision(ApprovalDecision::ViewFull)) => Viewing(v),
            (Presenting(v), ApprovalEvent::TimedOut | ApprovalEvent::Malformed) => Presenting(v),
            (Reworking(_), ApprovalEvent::Reworked(parts)) => {
                self.rewrite = None;
                Presenting(self.history.push(parts).version)
            }
            (Viewing(v), ApprovalEvent::Shown) => Presenting(v),
            (state, event) => {
                return Err(EngineError::InvalidTransition {
                    from: state.to_string(),
                    event: event.name().to_owned(),
                })
            }
        };
        tracing::debug!(from = %self.state, to = %next, "approval transition");
        self.state = next;
        Ok(next)
    }

    /// Drive the loop to `Approved`, returning the approved draft and the full history.
    pub async fn run<H>(mut self, host: &mut H) -> Result<(ReportDraft, ReportVersionHistory), EngineError>
    where
        H: ApprovalHost + ?Sized,
    {
        loop {
            match self.state {
                ApprovalState::Presenting(_) => {
                    let draft = self.current()?.clone();
                    let event = match host.request_decision(&draft, &self.history).await {
                        Ok(decision) => ApprovalEvent::Decision(decision),
                        Err(EngineError::Timeout { .. }) => {
                            host.notify(ProgressData::new(format!(
                                "No decision received for version {}; asking again.",
                                draft.version
                            )))
                            .await;
                            ApprovalEvent::TimedOut
                        }
                        Err(EngineError::MalformedDecision(reason)) => {
                            host.notify(ProgressData::new(format!(
                                "Could not understand that decision ({reason}). Please choose approve, rewrite or view_full."
                            )))
                            .await;
                            ApprovalEvent::Malformed
                        }
                        Err(e) => return Err(e),
                    };
                    let _ = self.apply(event)?;
                }
                ApprovalState::Reworking(_) => {
                    let mode = self.rewrite.clone().ok_or_else(|| EngineError::InvalidTransition {
                        from: self.state.to_string(),
                        event: "rework without a rewrite mode".into(),
                    })?;
                    let parts = host.rework(&mode).await?;
                    let next = self.apply(ApprovalEvent::Reworked(parts))?;
                    host.notify(ProgressData::new(format!(
                        "Report rewritten (version {}).",
                        next.version()
                    )))
                    .await;
                }
                ApprovalState::Viewing(v) => {
                    let full = assemble_final_report(&self.current()?.parts);
                    host.notify(
                        ProgressData::new(format!("Showing the full report (version {v}).")).activity(
                            AgentActivity::new("viewing_full_report", format!("Version {v}"))
                                .with("full_report", full),
                        ),
                    )
                    .await;
                    let _ = self.apply(ApprovalEvent::Shown)?;
                }
                ApprovalState::Approved(_) => {
                    let draft = self.current()?.clone();
                    return Ok((draft, self.history));
                }
            }
        }
    }

    fn current(&self) -> Result<&ReportDraft, EngineError> {
        self.history.current().ok_or_else(|| EngineError::InvalidTransition {
            from: self.state.to_string(),
            event: "empty history".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use storm_core::messages::AskKind;

    use super::*;

    fn parts(tag: &str) -> ReportParts {
        ReportParts::new(format!("intro {tag}"), format!("main {tag}"), format!("end {tag}"))
    }

    /// Answers from a script and records what it was shown.
    struct ScriptedHost {
        answers: VecDeque<Result<ApprovalDecision, EngineError>>,
        presented: Vec<u32>,
        reworks: Vec<RewriteMode>,
        notes: Vec<String>,
    }

    impl ScriptedHost {
        fn new(answers: Vec<Result<ApprovalDecision, EngineError>>) -> Self {
            Self {
                answers: answers.into(),
                presented: Vec::new(),
                reworks: Vec::new(),
                notes: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ApprovalHost for ScriptedHost {
        async fn request_decision(
            &mut self,
            draft: &ReportDraft,
            history: &ReportVersionHistory,
        ) -> Result<ApprovalDecision, EngineError> {
            assert_eq!(history.len() as u32, draft.version);
            self.presented.push(draft.version);
            self.answers.pop_front().unwrap_or(Ok(ApprovalDecision::Approve))
        }

        async fn rework(&mut self, mode: &RewriteMode) -> Result<ReportParts, EngineError> {
            self.reworks.push(mode.clone());
            Ok(parts(&format!("r{}", self.reworks.len())))
        }

        async fn notify(&mut self, progress: ProgressData) {
            self.notes.push(progress.message);
        }
    }

    fn feedback(text: &str) -> Result<ApprovalDecision, EngineError> {
        Ok(ApprovalDecision::Rewrite(RewriteMode::Feedback(text.into())))
    }

    #[tokio::test]
    async fn approve_immediately() {
        let mut host = ScriptedHost::new(vec![Ok(ApprovalDecision::Approve)]);
        let (draft, history) = ApprovalLoop::new(parts("v1")).run(&mut host).await.unwrap();
        assert_eq!(draft.version, 1);
        assert_eq!(history.len(), 1);
        assert!(host.reworks.is_empty());
    }

    #[tokio::test]
    async fn three_rewrites_then_approve() {
        let mut host = ScriptedHost::new(vec![
            feedback("more numbers"),
            Ok(ApprovalDecision::Rewrite(RewriteMode::Complete)),
            feedback(""),
            Ok(ApprovalDecision::Approve),
        ]);
        let (draft, history) = ApprovalLoop::new(parts("v1")).run(&mut host).await.unwrap();

        assert_eq!(draft.version, 4);
        assert_eq!(history.len(), 4);
        assert_eq!(draft.parts, parts("r3"));
        assert_eq!(host.presented, vec![1, 2, 3, 4]);
        assert_eq!(
            host.reworks,
            vec![
                RewriteMode::Feedback("more numbers".into()),
                RewriteMode::Complete,
                RewriteMode::Feedback(String::new()),
            ]
        );
        let versions: Vec<u32> = history.iter().map(|d| d.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn view_full_never_changes_version() {
        let mut host = ScriptedHost::new(vec![
            Ok(ApprovalDecision::ViewFull),
            Ok(ApprovalDecision::ViewFull),
            Ok(ApprovalDecision::Approve),
        ]);
        let (draft, history) = ApprovalLoop::new(parts("v1")).run(&mut host).await.unwrap();
        assert_eq!(draft.version, 1);
        assert_eq!(history.len(), 1);
        assert_eq!(host.presented, vec![1, 1, 1]);
        assert!(host.notes.iter().any(|n| n.contains("full report")));
    }

    #[tokio::test]
    async fn view_full_between_rewrites_adds_no_version() {
        let mut host = ScriptedHost::new(vec![
            feedback("more numbers"),
            Ok(ApprovalDecision::ViewFull),
            Ok(ApprovalDecision::Rewrite(RewriteMode::Complete)),
            feedback("tighter conclusion"),
            Ok(ApprovalDecision::Approve),
        ]);
        let (draft, history) = ApprovalLoop::new(parts("v1")).run(&mut host).await.unwrap();

        assert_eq!(draft.version, 4);
        assert_eq!(history.len(), 4);
        assert_eq!(host.presented, vec![1, 2, 2, 3, 4]);
        assert_eq!(host.reworks.len(), 3);
        assert_eq!(draft.parts, parts("r3"));
    }

    #[tokio::test]
    async fn timeout_and_garbage_represent_same_version() {
        let mut host = ScriptedHost::new(vec![
            Err(EngineError::Timeout {
                kind: AskKind::ReportApproval,
                after: Duration::from_secs(300),
            }),
            Err(EngineError::MalformedDecision("unknown action 'publish'".into())),
            Ok(ApprovalDecision::Approve),
        ]);
        let (draft, history) = ApprovalLoop::new(parts("v1")).run(&mut host).await.unwrap();
        assert_eq!(draft.version, 1);
        assert_eq!(history.len(), 1);
        assert_eq!(host.presented, vec![1, 1, 1]);
        assert!(host.notes[1].contains("publish"));
    }

    #[tokio::test]
    async fn session_loss_aborts_loop() {
        let sid = storm_core::ids::SessionId::from_raw("s1");
        let mut host = ScriptedHost::new(vec![
            feedback("x"),
            Err(EngineError::SessionClosed(sid)),
        ]);
        let err = ApprovalLoop::new(parts("v1")).run(&mut host).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionClosed(_)));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut approval = ApprovalLoop::new(parts("v1"));
        let err = approval.apply(ApprovalEvent::Reworked(parts("x"))).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(approval.state(), ApprovalState::Presenting(1));
        assert_eq!(approval.history().len(), 1);

        assert_eq!(
            approval.apply(ApprovalEvent::Decision(ApprovalDecision::Approve)).unwrap(),
            ApprovalState::Approved(1)
        );
        assert!(approval.state().is_terminal());
        assert!(approval
            .apply(ApprovalEvent::Decision(ApprovalDecision::Approve))
            .is_err());
    }

    #[test]
    fn rework_appends_next_version() {
        let mut approval = ApprovalLoop::new(parts("v1"));
        let _ = approval
            .apply(ApprovalEvent::Decision(ApprovalDecision::Rewrite(RewriteMode::Complete)))
            .unwrap();
        assert_eq!(approval.state(), ApprovalState::Reworking(1));
        assert_eq!(
            approval.apply(ApprovalEvent::Reworked(parts("v2"))).unwrap(),
            ApprovalState::Presenting(2)
        );
        assert_eq!(approval.history().current().unwrap().parts, parts("v2"));
    }

    #[test]
    fn state_display() {
        assert_eq!(ApprovalState::Reworking(3).to_string(), "reworking(3)");
        assert_eq!(ApprovalState::Viewing(2).version(), 2);
    }
}
