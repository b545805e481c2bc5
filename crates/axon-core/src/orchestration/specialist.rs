//! Specialist worker.
//!
//! A specialist runs its configured actions as a linear workflow against each
//! request payload (first action gets the payload, each later one the
//! previous output) and publishes the last output on its result topic with
//! `agent_id`, `task_id` and `status` filled in. When the run fails, the
//! result says `status: "failed"` so an orchestrator can account for it.
//!
//! Every signal in the mailbox is treated as a request: the bus subscription
//! or the orchestrator that feeds the worker decides what arrives.
//!
//! The worker's state starts from the `state_schema` defaults. An action can
//! return `state_updates` (an object) to change it; the merged state must
//! still satisfy the schema, otherwise the old state is kept.

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use super::config::ResolvedAgent;
use crate::agents::{AgentHandle, AgentKind, AgentMessage};
use crate::events::Signal;
use crate::state::AxonState;
use crate::topics::{validate_fields, FieldSpec};
use crate::workflow::{StepSpec, WorkflowSpec};

pub const STATE_UPDATES_KEY: &str = "state_updates";

/// Spawn a specialist worker for `agent`.
pub fn spawn_specialist(state: AxonState, agent: ResolvedAgent) -> AgentHandle {
    let id = agent.id().to_string();
    AgentHandle::spawn(id, AgentKind::Specialist, move |rx| run(state, agent, rx))
}

async fn run(state: AxonState, agent: ResolvedAgent, mut rx: mpsc::UnboundedReceiver<AgentMessage>) {
    let workflow = action_workflow(&agent);
    let mut memory = initial_state(&agent.config.state_schema);
    tracing::info!(
        "[Specialist] {} started ({} action(s))",
        agent.id(),
        agent.config.actions.len()
    );

    while let Some(message) = rx.recv().await {
        match message {
            AgentMessage::Signal(signal) => {
                memory = handle_request(&state, &agent, &workflow, memory, &signal).await;
            }
            AgentMessage::Shutdown => break,
        }
    }

    tracing::info!("[Specialist] {} stopped", agent.id());
}

/// The actions of a specialist as a linear workflow.
pub fn action_workflow(agent: &ResolvedAgent) -> WorkflowSpec {
    let mut spec = WorkflowSpec::new(format!("specialist:{}", agent.id()));
    let mut previous: Option<String> = None;
    for (i, action) in agent.config.actions.iter().enumerate() {
        let id = if agent.config.actions[..i].contains(action) {
            format!("{}_{}", action, i + 1)
        } else {
            action.clone()
        };
        let mut step = StepSpec::new(id.clone(), action.clone()).with_retry(agent.config.retry.clone());
        step = match &previous {
            Some(prev) => step
                .requires([prev.clone()])
                .with_params(Value::String(format!("${{results.{}}}", prev))),
            None => step.with_params(Value::String("${input}".to_string())),
        };
        spec = spec.step(step);
        previous = Some(id);
    }
    spec
}

/// State object holding every schema default.
pub fn initial_state(schema: &[FieldSpec]) -> Value {
    let mut state = Map::new();
    for field in schema {
        if let Ok(field) = field.normalized() {
            if let Some(default) = field.default {
                state.insert(field.name, default);
            }
        }
    }
    Value::Object(state)
}

/// Merge `updates` into `memory`, keeping the old state when the result
/// violates the schema.
pub fn apply_state_updates(agent_id: &str, schema: &[FieldSpec], memory: Value, updates: &Value) -> Value {
    let Value::Object(changes) = updates else {
        tracing::warn!("[Specialist] {} ignoring non-object state_updates", agent_id);
        return memory;
    };
    let mut merged = match &memory {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    for (k, v) in changes {
        merged.insert(k.clone(), v.clone());
    }
    match validate_fields(schema, &Value::Object(merged)) {
        Ok(next) => next,
        Err(e) => {
            tracing::warn!("[Specialist] {} rejected state update: {}", agent_id, e);
            memory
        }
    }
}

async fn handle_request(
    state: &AxonState,
    agent: &ResolvedAgent,
    workflow: &WorkflowSpec,
    memory: Value,
    request: &Signal,
) -> Value {
    let agent_id = agent.id();
    let task_id = request.correlation_id().to_string();
    let context = json!({
        "agent_id": agent_id,
        "task_id": task_id,
        "source": request.source(),
        "state": memory.clone(),
    });

    tracing::debug!("[Specialist] {} handling task {}", agent_id, task_id);

    let (payload, memory) = match state
        .engine
        .execute(workflow, request.data().clone(), context)
        .await
    {
        Ok(execution) => {
            let last = workflow
                .steps
                .last()
                .and_then(|step| execution.results.get(&step.id))
                .cloned()
                .unwrap_or(Value::Null);
            let mut payload = match last {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("output".to_string(), other);
                    map
                }
            };
            let memory = match payload.remove(STATE_UPDATES_KEY) {
                Some(updates) => apply_state_updates(agent_id, &agent.config.state_schema, memory, &updates),
                None => memory,
            };
            payload
                .entry("status".to_string())
                .or_insert_with(|| Value::String("ok".to_string()));
            (payload, memory)
        }
        Err(failure) => {
            tracing::error!(
                "[Specialist] {} failed task {}: {}",
                agent_id,
                task_id,
                failure.error
            );
            (failed_payload(&failure.error.to_string()), memory)
        }
    };

    let ok = payload.get("status").and_then(Value::as_str) != Some("failed");
    if let Err(e) = publish_result(state, agent, &task_id, payload).await {
        tracing::error!(
            "[Specialist] {} could not publish result for task {}: {}",
            agent_id,
            task_id,
            e
        );
        if ok {
            let fallback = failed_payload(&format!("result rejected: {}", e));
            if let Err(e) = publish_result(state, agent, &task_id, fallback).await {
                tracing::error!("[Specialist] {} could not report failure: {}", agent_id, e);
            }
        }
    }

    memory
}

fn failed_payload(error: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("status".to_string(), Value::String("failed".to_string()));
    payload.insert("error".to_string(), Value::String(error.to_string()));
    payload
}

async fn publish_result(
    state: &AxonState,
    agent: &ResolvedAgent,
    task_id: &str,
    mut payload: Map<String, Value>,
) -> Result<(), crate::error::AxonError> {
    payload.insert("agent_id".to_string(), Value::String(agent.id().to_string()));
    payload.insert("task_id".to_string(), Value::String(task_id.to_string()));

    let signal = Signal::new(agent.roles.result.wire_type.clone(), Value::Object(payload))
        .with_subject(task_id)
        .with_source(agent.id());
    let report = state.event_bus.publish(signal).await?;
    tracing::debug!(
        "[Specialist] {} published result {} for task {} ({} recipient(s))",
        agent.id(),
        report.signal_id,
        task_id,
        report.recipients()
    );
    Ok(())
}
