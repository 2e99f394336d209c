//! Bookkeeping for research runs started over HTTP.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use storm_core::ids::{RunId, SessionId};
use storm_core::models::ResearchResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskRecord {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub topic: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
pub struct TaskTracker {
    tasks: DashMap<RunId, TaskRecord>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a run as running. A record with the same run id is replaced.
    pub fn start(&self, session_id: SessionId, run_id: RunId, topic: impl Into<String>, config: Value) {
        let record = TaskRecord {
            session_id,
            run_id: run_id.clone(),
            topic: topic.into(),
            status: TaskStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            config,
            result: None,
            error: None,
        };
        let _ = self.tasks.insert(run_id, record);
    }

    /// Returns false if the record was deleted while the run was in flight.
    pub fn complete(&self, run_id: &RunId, result: ResearchResult) -> bool {
        self.finish(run_id, |record| {
            record.status = TaskStatus::Completed;
            record.result = Some(result);
        })
    }

    /// Mark a run failed with the error text shown to HTTP clients.
    pub fn fail(&self, run_id: &RunId, error: impl Into<String>) -> bool {
        let error = error.into();
        self.finish(run_id, |record| {
            record.status = TaskStatus::Failed;
            record.error = Some(error);
        })
    }

    fn finish(&self, run_id: &RunId, update: impl FnOnce(&mut TaskRecord)) -> bool {
        match self.tasks.get_mut(run_id) {
            Some(mut record) => {
                update(&mut record);
                record.completed_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Snapshot of one record.
    pub fn get(&self, run_id: &RunId) -> Option<TaskRecord> {
        self.tasks.get(run_id).map(|r| r.value().clone())
    }

    /// Run ids, oldest first.
    pub fn list(&self) -> Vec<RunId> {
        let mut entries: Vec<(DateTime<Utc>, RunId)> = self
            .tasks
            .iter()
            .map(|e| (e.created_at, e.key().clone()))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// Forget a run. A workflow still in flight keeps running but its outcome is
    /// no longer recorded.
    pub fn delete(&self, run_id: &RunId) -> bool {
        self.tasks.remove(run_id).is_some()
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tracker_with(run: &str) -> TaskTracker {
        let tracker = TaskTracker::new();
        tracker.start(
            SessionId::from_raw("s1"),
            RunId::from_raw(run),
            "Grid storage",
            json!({"max_analysts": 3}),
        );
        tracker
    }

    #[test]
    fn new_task_is_running() {
        let tracker = tracker_with("r1");
        let record = tracker.get(&RunId::from_raw("r1")).unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert!(record.completed_at.is_none());
        assert_eq!(tracker.list(), vec![RunId::from_raw("r1")]);
    }

    #[test]
    fn failure_is_recorded() {
        let tracker = tracker_with("r1");
        assert!(tracker.fail(&RunId::from_raw("r1"), "session closed: s1"));
        let record = tracker.get(&RunId::from_raw("r1")).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("session closed: s1"));
        assert!(record.completed_at.is_some());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn delete_removes_and_finishing_deleted_is_noop() {
        let tracker = tracker_with("r1");
        assert!(tracker.delete(&RunId::from_raw("r1")));
        assert!(!tracker.delete(&RunId::from_raw("r1")));
        assert!(!tracker.fail(&RunId::from_raw("r1"), "late"));
        assert_eq!(tracker.count(), 0);
    }
}
