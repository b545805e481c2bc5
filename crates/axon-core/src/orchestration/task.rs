//! Task state - one in-flight unit of orchestrated work.
//!
//! A `TaskState` is owned by the orchestrator worker that created it. Every
//! transition consumes the old value and returns the new one.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload fields compared when two results for the same task disagree.
pub const CONFLICT_FIELDS: [&str; 2] = ["severity", "outcome"];

/// How one disagreement between specialists was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationRecord {
    pub field: String,
    /// Agents whose results took part, in arrival order
    pub agents: Vec<String>,
    /// agent id → the value it reported
    pub values: BTreeMap<String, Value>,
    pub winner: String,
    pub resolved: Value,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Ordered record of the decisions taken for this task
    pub decision_path: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub classify_attempts: u32,
    pub negotiations: Vec<NegotiationRecord>,
    /// Specialists that failed, including ones that never answered
    pub failed: Vec<String>,
    /// Specialists that never answered before the deadline
    pub missing: Vec<String>,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub orchestrator_id: String,
    pub classification: Value,
    /// Specialists asked to work on the task
    pub expected: Vec<String>,
    /// Specialists that have not responded yet
    pub pending: BTreeSet<String>,
    /// Specialist outputs in arrival order
    pub results: Vec<Value>,
    /// field → value agreed through negotiation
    pub consensus: BTreeMap<String, Value>,
    pub metadata: TaskMetadata,
}

impl TaskState {
    pub fn new(task_id: impl Into<String>, orchestrator_id: impl Into<String>, classification: Value) -> Self {
        Self {
            task_id: task_id.into(),
            orchestrator_id: orchestrator_id.into(),
            classification,
            expected: Vec::new(),
            pending: BTreeSet::new(),
            results: Vec::new(),
            consensus: BTreeMap::new(),
            metadata: TaskMetadata {
                started_at: Some(Utc::now()),
                ..TaskMetadata::default()
            },
        }
    }

    pub fn with_specialists(mut self, specialists: &[String]) -> Self {
        self.expected = specialists.to_vec();
        self.pending = specialists.iter().cloned().collect();
        self
    }

    pub fn decide(mut self, step: impl Into<String>) -> Self {
        self.metadata.decision_path.push(step.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, agent_id: &str) -> bool {
        self.pending.contains(agent_id)
    }

    /// Agent id carried by a result payload.
    pub fn agent_of(result: &Value) -> Option<&str> {
        result.get("agent_id").and_then(Value::as_str)
    }

    /// Conflict fields on which `incoming` disagrees with a recorded result.
    pub fn conflicts_with(&self, incoming: &Value) -> Vec<&'static str> {
        CONFLICT_FIELDS
            .iter()
            .copied()
            .filter(|field| {
                let Some(new) = incoming.get(*field).filter(|v| !v.is_null()) else {
                    return false;
                };
                self.results
                    .iter()
                    .filter_map(|r| r.get(*field))
                    .any(|old| !old.is_null() && old != new)
            })
            .collect()
    }

    /// Append a specialist's result and take it off the pending set.
    pub fn record_result(mut self, agent_id: &str, result: Value) -> Self {
        self.pending.remove(agent_id);
        if result.get("status").and_then(Value::as_str) == Some("failed")
            && !self.metadata.failed.iter().any(|f| f == agent_id)
        {
            self.metadata.failed.push(agent_id.to_string());
        }
        self.results.push(result);
        self.metadata.decision_path.push(format!("result:{}", agent_id));
        self
    }

    /// Give up on a specialist that could not be reached at all.
    pub fn record_failure(mut self, agent_id: &str, reason: &str) -> Self {
        self.pending.remove(agent_id);
        if !self.metadata.failed.iter().any(|f| f == agent_id) {
            self.metadata.failed.push(agent_id.to_string());
        }
        self.metadata
            .decision_path
            .push(format!("failed:{}:{}", agent_id, reason));
        self
    }

    /// Close the task at its deadline; everything still pending is missing.
    pub fn time_out(mut self) -> Self {
        let missing: Vec<String> = std::mem::take(&mut self.pending).into_iter().collect();
        for agent in &missing {
            if !self.metadata.failed.contains(agent) {
                self.metadata.failed.push(agent.clone());
            }
        }
        self.metadata.missing = missing;
        self.metadata.timed_out = true;
        self.metadata.decision_path.push("timeout".to_string());
        self
    }

    pub fn finish(mut self) -> Self {
        let now = Utc::now();
        self.metadata.completed_at = Some(now);
        self.metadata.duration_ms = self
            .metadata
            .started_at
            .map(|s| (now - s).num_milliseconds());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> TaskState {
        TaskState::new("t1", "orch", json!({"label": "security"}))
            .with_specialists(&["sec".to_string(), "perf".to_string()])
    }

    #[test]
    fn test_record_result_updates_pending() {
        let state = task().record_result("sec", json!({"agent_id": "sec", "severity": "high"}));
        assert!(!state.is_pending("sec"));
        assert!(state.is_pending("perf"));
        assert!(!state.is_complete());
        let state = state.record_result("perf", json!({"agent_id": "perf", "status": "failed"}));
        assert!(state.is_complete());
        assert_eq!(state.metadata.failed, vec!["perf"]);
        assert_eq!(state.results.len(), 2);
    }

    #[test]
    fn test_conflicts() {
        let state = task().record_result("sec", json!({"agent_id": "sec", "severity": "high"}));
        assert_eq!(state.conflicts_with(&json!({"severity": "low"})), vec!["severity"]);
        assert!(state.conflicts_with(&json!({"severity": "high"})).is_empty());
        assert!(state.conflicts_with(&json!({"other": 1})).is_empty());
    }

    #[test]
    fn test_time_out_marks_missing() {
        let state = task()
            .record_result("sec", json!({"agent_id": "sec"}))
            .time_out()
            .finish();
        assert_eq!(state.metadata.missing, vec!["perf"]);
        assert_eq!(state.metadata.failed, vec!["perf"]);
        assert!(state.metadata.timed_out);
        assert!(state.is_complete());
        assert!(state.metadata.duration_ms.is_some());
    }
}
