//! Runs one interview per analyst and gathers the results in input order.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use storm_core::models::{Analyst, InterviewResult};
use tokio::task::JoinSet;

use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanOutMode {
    /// Every unit starts immediately.
    Parallel,
    /// One unit at a time, in input order.
    Sequential,
}

impl FanOutMode {
    pub fn from_parallel(parallel: bool) -> Self {
        if parallel {
            Self::Parallel
        } else {
            Self::Sequential
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitEvent {
    Started {
        index: usize,
        total: usize,
        analyst: String,
    },
    Finished {
        index: usize,
        total: usize,
        analyst: String,
        ok: bool,
    },
}

/// Receives per-unit progress.
#[async_trait]
pub trait UnitObserver: Send + Sync {
    async fn on_unit(&self, event: UnitEvent);
}

pub struct NoopObserver;

#[async_trait]
impl UnitObserver for NoopObserver {
    async fn on_unit(&self, _event: UnitEvent) {}
}

/// Execute `work` once per analyst.
///
/// The output has one entry per analyst, in input order. A unit that returns
/// an error or panics is replaced by [`InterviewResult::failed`]; siblings are
/// never cancelled.
pub async fn run<F, Fut>(
    analysts: Vec<Analyst>,
    mode: FanOutMode,
    work: F,
    observer: Arc<dyn UnitObserver>,
) -> Vec<InterviewResult>
where
    F: Fn(Analyst) -> Fut,
    Fut: Future<Output = Result<InterviewResult, EngineError>> + Send + 'static,
{
    let total = analysts.len();
    let mut slots: Vec<Option<InterviewResult>> = vec![None; total];

    match mode {
        FanOutMode::Parallel => {
            let mut set = JoinSet::new();
            for (index, analyst) in analysts.iter().enumerate() {
                observer
                    .on_unit(UnitEvent::Started {
                        index,
                        total,
                        analyst: analyst.label(),
                    })
                    .await;
                let unit = AssertUnwindSafe(work(analyst.clone())).catch_unwind();
                let _ = set.spawn(async move { (index, unit.await) });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, outcome)) => {
                        let result = settle(index, &analysts[index], outcome);
                        finish(&*observer, index, total, &result).await;
                        slots[index] = Some(result);
                    }
                    Err(e) => tracing::error!(error = %e, "interview task aborted"),
                }
            }
        }
        FanOutMode::Sequential => {
            for (index, analyst) in analysts.iter().enumerate() {
                observer
                    .on_unit(UnitEvent::Started {
                        index,
                        total,
                        analyst: analyst.label(),
                    })
                    .await;
                let outcome = AssertUnwindSafe(work(analyst.clone())).catch_unwind().await;
                let result = settle(index, analyst, outcome);
                finish(&*observer, index, total, &result).await;
                slots[index] = Some(result);
            }
        }
    }

    slots
        .into_iter()
        .zip(analysts)
        .map(|(slot, analyst)| {
            slot.unwrap_or_else(|| InterviewResult::failed(analyst, "interview did not complete"))
        })
        .collect()
}

fn settle(
    index: usize,
    analyst: &Analyst,
    outcome: std::thread::Result<Result<InterviewResult, EngineError>>,
) -> InterviewResult {
    let reason = match outcome {
        Ok(Ok(result)) => return result,
        Ok(Err(e)) => e.to_string(),
        Err(_) => "interview panicked".to_owned(),
    };
    let failure = EngineError::UnitFailure {
        index,
        analyst: analyst.name.clone(),
        reason,
    };
    tracing::warn!(error = %failure, "interview failed");
    InterviewResult::failed(analyst.clone(), failure.to_string())
}

async fn finish(observer: &dyn UnitObserver, index: usize, total: usize, result: &InterviewResult) {
    observer
        .on_unit(UnitEvent::Finished {
            index,
            total,
            analyst: result.analyst.label(),
            ok: !result.is_error(),
        })
        .await;
}
