//! Orchestration strategies - the behavior behind `classify_fn`,
//! `aggregation_fn` and `negotiate_fn`.
//!
//! Configurations name strategies; the runtime binds the names to
//! implementations from a [`StrategyRegistry`] when the configuration loads.
//! The control flow of an orchestrator is the same whichever strategy is
//! bound.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{json, Map, Value};

use super::task::{NegotiationRecord, TaskState};
use crate::error::AxonError;

pub const DEFAULT_STRATEGY: &str = "default";
pub const SEVERITY_STRATEGY: &str = "severity";

/// Ranked severities, lowest first.
pub const SEVERITY_LEVELS: [&str; 4] = ["low", "medium", "high", "critical"];

pub fn severity_rank(value: &Value) -> Option<usize> {
    let s = value.as_str()?;
    SEVERITY_LEVELS.iter().position(|l| l.eq_ignore_ascii_case(s))
}

pub trait OrchestrationStrategy: Send + Sync {
    /// Classify a request payload.
    fn classify(&self, payload: &Value) -> Result<Value, String> {
        default_classify(payload)
    }

    /// Specialists to spawn when the configuration does not list them.
    fn specialists(&self, classification: &Value, available: &[String]) -> Vec<String> {
        match classification.get("specialists").and_then(Value::as_array) {
            Some(list) => list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => available.to_vec(),
        }
    }

    /// Settle a disagreement between `incoming` and the recorded results.
    fn negotiate(&self, incoming: &Value, state: TaskState) -> TaskState {
        // first recorded value stands
        let mut state = state;
        for field in state.conflicts_with(incoming) {
            let Some(record) = first_wins(field, incoming, &state) else {
                continue;
            };
            state.consensus.insert(field.to_string(), record.resolved.clone());
            state.metadata.negotiations.push(record);
        }
        state
    }

    /// Build the summary payload from the collected results.
    fn aggregate(&self, results: &[Value], state: &TaskState) -> Result<Value, String> {
        let mut summary = Map::new();
        summary.insert("classification".to_string(), state.classification.clone());
        summary.insert("results".to_string(), Value::Array(results.to_vec()));
        summary.insert("result_count".to_string(), Value::from(results.len()));
        for (field, value) in &state.consensus {
            summary.insert(field.clone(), value.clone());
        }
        Ok(Value::Object(summary))
    }
}

/// `label` / `kind` of the payload (or `"default"`), plus its
/// `specialists` list when present.
pub fn default_classify(payload: &Value) -> Result<Value, String> {
    let label = payload
        .get("label")
        .or_else(|| payload.get("kind"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_STRATEGY);
    let mut out = json!({ "label": label });
    if let Some(list) = payload.get("specialists").filter(|v| v.is_array()) {
        out["specialists"] = list.clone();
    }
    Ok(out)
}

/// Label used to look up `spawn_specialists` maps.
pub fn classification_label(classification: &Value) -> &str {
    match classification {
        Value::String(s) => s,
        other => other
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_STRATEGY),
    }
}

fn participants(field: &str, incoming: &Value, state: &TaskState) -> (Vec<String>, std::collections::BTreeMap<String, Value>) {
    let mut agents = Vec::new();
    let mut values = std::collections::BTreeMap::new();
    for result in state.results.iter().chain(std::iter::once(incoming)) {
        let (Some(agent), Some(value)) = (TaskState::agent_of(result), result.get(field)) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if !agents.iter().any(|a| a == agent) {
            agents.push(agent.to_string());
        }
        values.insert(agent.to_string(), value.clone());
    }
    (agents, values)
}

fn first_wins(field: &str, incoming: &Value, state: &TaskState) -> Option<NegotiationRecord> {
    let (agents, values) = participants(field, incoming, state);
    let winner = agents.first()?.clone();
    let resolved = values.get(&winner)?.clone();
    Some(NegotiationRecord {
        field: field.to_string(),
        agents,
        values,
        winner,
        resolved,
        rationale: "first reported value kept".to_string(),
    })
}

/// Default behavior throughout.
pub struct DefaultStrategy;

impl OrchestrationStrategy for DefaultStrategy {}

/// Prefers the most severe finding.
///
/// Negotiation on `severity` picks the highest of `low < medium < high <
/// critical`; other fields fall back to first-reported. The summary carries
/// the overall `severity`.
pub struct SeverityStrategy;

impl OrchestrationStrategy for SeverityStrategy {
    fn negotiate(&self, incoming: &Value, state: TaskState) -> TaskState {
        let mut state = state;
        for field in state.conflicts_with(incoming) {
            let record = if field == "severity" {
                let (agents, values) = participants(field, incoming, &state);
                let winner = agents
                    .iter()
                    .filter_map(|a| values.get(a).and_then(severity_rank).map(|r| (r, a)))
                    // earliest agent wins ties
                    .fold(None::<(usize, &String)>, |best, (rank, agent)| match best {
                        Some((r, _)) if r >= rank => best,
                        _ => Some((rank, agent)),
                    })
                    .map(|(_, a)| a.clone());
                match winner {
                    Some(winner) => {
                        let resolved = values.get(&winner).cloned().unwrap_or(Value::Null);
                        Some(NegotiationRecord {
                            field: field.to_string(),
                            agents,
                            values,
                            winner,
                            resolved,
                            rationale: "highest severity wins".to_string(),
                        })
                    }
                    None => first_wins(field, incoming, &state),
                }
            } else {
                first_wins(field, incoming, &state)
            };

            if let Some(record) = record {
                state.consensus.insert(field.to_string(), record.resolved.clone());
                state.metadata.negotiations.push(record);
            }
        }
        state
    }

    fn aggregate(&self, results: &[Value], state: &TaskState) -> Result<Value, String> {
        let mut summary = DefaultStrategy.aggregate(results, state)?;
        let highest = results
            .iter()
            .filter_map(|r| r.get("severity"))
            .filter_map(|v| severity_rank(v).map(|rank| (rank, v)))
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, v)| v.clone());
        let severity = state
            .consensus
            .get("severity")
            .cloned()
            .or(highest)
            .unwrap_or_else(|| Value::String("low".to_string()));
        summary["severity"] = severity;
        Ok(summary)
    }
}

/// Named strategies available to agent configurations.
pub struct StrategyRegistry {
    strategies: RwLock<HashMap<String, Arc<dyn OrchestrationStrategy>>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut strategies: HashMap<String, Arc<dyn OrchestrationStrategy>> = HashMap::new();
        strategies.insert(DEFAULT_STRATEGY.to_string(), Arc::new(DefaultStrategy));
        strategies.insert(SEVERITY_STRATEGY.to_string(), Arc::new(SeverityStrategy));
        Self {
            strategies: RwLock::new(strategies),
        }
    }
}

impl StrategyRegistry {
    /// Registry holding the built-in `default` and `severity` strategies.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, strategy: Arc<dyn OrchestrationStrategy>) -> Result<(), AxonError> {
        let mut strategies = self.strategies.write().unwrap_or_else(PoisonError::into_inner);
        if strategies.contains_key(name) {
            return Err(AxonError::AlreadyRegistered(format!("strategy '{}'", name)));
        }
        strategies.insert(name.to_string(), strategy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn OrchestrationStrategy>, AxonError> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AxonError::NotFound(format!("strategy '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}
