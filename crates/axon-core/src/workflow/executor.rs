//! Workflow Engine - runs a workflow spec against one input.
//!
//! The engine:
//! 1. Validates the workflow (unique ids, known `requires`, acyclic, registered actions)
//! 2. Orders steps topologically, ties broken by declaration order
//! 3. Starts every step whose dependencies have succeeded, concurrently
//! 4. Retries failed attempts with exponential backoff
//! 5. Applies `on_error` once a step is out of attempts: `halt` aborts the
//!    run, `continue` skips the step's dependents and keeps going
//! 6. Computes the named outputs from the steps that produced a result

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;

use super::action::{Action, ActionRegistry};
use super::persistence::{SnapshotContext, SnapshotStore};
use super::schema::{OnError, Params, StepSpec, WorkflowSpec};
use super::template::{lookup_path, resolve_value, StepEnv};
use crate::config::WorkflowSettings;
use crate::error::AxonError;

// ─── Audit trail ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    /// Was running when another step halted the run
    Aborted,
}

/// Audit entry for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAudit {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A finished, successful run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow: String,
    /// step id → output, for steps that succeeded
    pub results: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    /// In completion order
    pub audit_trail: Vec<StepAudit>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn audit(&self, step_id: &str) -> Option<&StepAudit> {
        self.audit_trail.iter().find(|a| a.step_id == step_id)
    }

    /// Steps that failed under `on_error: continue`.
    pub fn failed_steps(&self) -> Vec<&str> {
        self.audit_trail
            .iter()
            .filter(|a| a.status == StepStatus::Failed)
            .map(|a| a.step_id.as_str())
            .collect()
    }
}

/// A run that halted, or could not start.
#[derive(Debug, Clone, thiserror::Error)]
#[error("workflow '{workflow}' failed: {error}")]
pub struct WorkflowFailure {
    pub execution_id: String,
    pub workflow: String,
    /// `None` when the run was rejected before any step started
    pub failed_step: Option<String>,
    #[source]
    pub error: AxonError,
    pub attempts: u32,
    pub results: BTreeMap<String, Value>,
    pub audit_trail: Vec<StepAudit>,
}

impl WorkflowFailure {
    fn rejected(execution_id: &str, workflow: &str, error: AxonError) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            workflow: workflow.to_string(),
            failed_step: None,
            error,
            attempts: 0,
            results: BTreeMap::new(),
            audit_trail: Vec::new(),
        }
    }
}

// ─── Engine ────────────────────────────────────────────────────────────────

/// Snapshot store plus the context key that identifies an execution in it.
#[derive(Clone)]
pub struct PersistenceConfig {
    pub store: Arc<dyn SnapshotStore>,
    pub correlation_key: String,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    actions: Arc<ActionRegistry>,
    settings: WorkflowSettings,
    persistence: Option<PersistenceConfig>,
}

struct StepOutcome {
    index: usize,
    audit: StepAudit,
    result: Result<Value, AxonError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl WorkflowEngine {
    pub fn new(actions: Arc<ActionRegistry>, settings: WorkflowSettings) -> Self {
        Self {
            actions,
            settings,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, store: Arc<dyn SnapshotStore>, correlation_key: impl Into<String>) -> Self {
        self.persistence = Some(PersistenceConfig {
            store,
            correlation_key: correlation_key.into(),
        });
        self
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Same settings and persistence, different action set.
    pub fn with_actions(&self, actions: Arc<ActionRegistry>) -> Self {
        Self {
            actions,
            ..self.clone()
        }
    }

    /// Check a spec without running it.
    pub fn validate(&self, spec: &WorkflowSpec) -> Result<(), AxonError> {
        self.plan(spec).map(|_| ())
    }

    /// Topological order of step indices.
    fn plan(&self, spec: &WorkflowSpec) -> Result<Vec<usize>, AxonError> {
        let fail = |msg: String| AxonError::Configuration(format!("workflow '{}': {}", spec.name, msg));

        if spec.steps.is_empty() {
            return Err(fail("has no steps".to_string()));
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in spec.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(fail(format!("step #{} has an empty id", i + 1)));
            }
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(fail(format!("duplicate step id '{}'", step.id)));
            }
        }

        let mut indegree = vec![0usize; spec.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); spec.steps.len()];
        for (i, step) in spec.steps.iter().enumerate() {
            if !self.actions.contains(&step.action) {
                return Err(fail(format!(
                    "step '{}' uses unregistered action '{}'",
                    step.id, step.action
                )));
            }
            let deps: BTreeSet<&str> = step.requires.iter().map(String::as_str).collect();
            for dep in deps {
                let d = *index.get(dep).ok_or_else(|| {
                    fail(format!("step '{}' requires unknown step '{}'", step.id, dep))
                })?;
                if d == i {
                    return Err(fail(format!("step '{}' requires itself", step.id)));
                }
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        for out in spec.outputs.iter() {
            if !index.contains_key(out.1.step.as_str()) {
                return Err(fail(format!("output '{}' references unknown step '{}'", out.0, out.1.step)));
            }
        }

        let mut ready: BTreeSet<usize> = (0..spec.steps.len()).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(spec.steps.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &dep in &dependents[i] {
                indegree[dep] -= 1;
                if indegree[dep] == 0 {
                    ready.insert(dep);
                }
            }
        }

        if order.len() != spec.steps.len() {
            let cyclic: Vec<&str> = (0..spec.steps.len())
                .filter(|i| indegree[*i] > 0)
                .map(|i| spec.steps[i].id.as_str())
                .collect();
            return Err(fail(format!("dependency cycle among steps {:?}", cyclic)));
        }
        Ok(order)
    }

    /// Run `spec` against `input`.
    pub async fn execute(
        &self,
        spec: &WorkflowSpec,
        input: Value,
        context: Value,
    ) -> Result<WorkflowExecution, WorkflowFailure> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let order = self
            .plan(spec)
            .map_err(|e| WorkflowFailure::rejected(&execution_id, &spec.name, e))?;

        let correlation_id = match &self.persistence {
            Some(p) => Some(
                correlation_value(&context, &p.correlation_key)
                    .map_err(|e| WorkflowFailure::rejected(&execution_id, &spec.name, e))?,
            ),
            None => None,
        };

        tracing::info!(
            "[Workflow] Starting '{}' ({}) with {} step(s)",
            spec.name,
            execution_id,
            spec.steps.len()
        );

        let deps: Vec<Vec<usize>> = spec
            .steps
            .iter()
            .map(|s| {
                s.requires
                    .iter()
                    .filter_map(|r| spec.steps.iter().position(|o| &o.id == r))
                    .collect()
            })
            .collect();

        let mut states = vec![StepState::Pending; spec.steps.len()];
        let mut started: Vec<Option<DateTime<Utc>>> = vec![None; spec.steps.len()];
        let mut results: BTreeMap<String, Value> = BTreeMap::new();
        let mut audit_trail: Vec<StepAudit> = Vec::new();
        let mut running: JoinSet<StepOutcome> = JoinSet::new();

        loop {
            for &i in &order {
                if states[i] != StepState::Pending {
                    continue;
                }
                if !deps[i].iter().all(|d| states[*d] == StepState::Succeeded) {
                    continue;
                }
                let step = &spec.steps[i];
                let action = match self.actions.get(&step.action) {
                    Ok(a) => a,
                    Err(e) => {
                        running.abort_all();
                        abort_running(spec, &states, &started, &step.id, &mut audit_trail);
                        return Err(WorkflowFailure {
                            execution_id,
                            workflow: spec.name.clone(),
                            failed_step: Some(step.id.clone()),
                            error: e,
                            attempts: 0,
                            results,
                            audit_trail,
                        });
                    }
                };
                let env = StepEnv {
                    input: input.clone(),
                    results: results.clone(),
                    context: context.clone(),
                    step_id: step.id.clone(),
                    workflow_name: spec.name.clone(),
                };
                let snapshot = match (&self.persistence, &correlation_id) {
                    (Some(p), Some(cid)) => Some((
                        p.store.clone(),
                        SnapshotContext {
                            workflow: spec.name.clone(),
                            step_id: step.id.clone(),
                            correlation_id: cid.clone(),
                            completed: results.keys().cloned().collect(),
                            context: context.clone(),
                        },
                    )),
                    _ => None,
                };

                tracing::debug!("[Workflow] {} → starting step '{}'", spec.name, step.id);
                states[i] = StepState::Running;
                started[i] = Some(Utc::now());
                running.spawn(run_step(
                    i,
                    step.clone(),
                    action,
                    env,
                    Duration::from_millis(self.settings.max_backoff_ms),
                    execution_id.clone(),
                    snapshot,
                ));
            }

            let outcome = match running.join_next().await {
                Some(Ok(outcome)) => outcome,
                Some(Err(e)) => {
                    running.abort_all();
                    abort_running(spec, &states, &started, "a panicked step", &mut audit_trail);
                    return Err(WorkflowFailure {
                        execution_id,
                        workflow: spec.name.clone(),
                        failed_step: None,
                        error: AxonError::Internal(format!("step task panicked: {}", e)),
                        attempts: 0,
                        results,
                        audit_trail,
                    });
                }
                None => break,
            };

            let step = &spec.steps[outcome.index];
            audit_trail.push(outcome.audit.clone());

            match outcome.result {
                Ok(value) => {
                    states[outcome.index] = StepState::Succeeded;
                    results.insert(step.id.clone(), value);
                }
                Err(error) => {
                    states[outcome.index] = StepState::Failed;
                    tracing::error!(
                        "[Workflow] {} → step '{}' failed after {} attempt(s): {}",
                        spec.name,
                        step.id,
                        outcome.audit.attempts,
                        error
                    );

                    if step.on_error == OnError::Halt {
                        running.abort_all();
                        abort_running(spec, &states, &started, &step.id, &mut audit_trail);
                        return Err(WorkflowFailure {
                            execution_id,
                            workflow: spec.name.clone(),
                            failed_step: Some(step.id.clone()),
                            error,
                            attempts: outcome.audit.attempts,
                            results,
                            audit_trail,
                        });
                    }

                    // order is topological, so one pass skips transitive dependents
                    for &i in &order {
                        if states[i] != StepState::Pending {
                            continue;
                        }
                        let blocker = deps[i]
                            .iter()
                            .find(|d| matches!(states[**d], StepState::Failed | StepState::Skipped));
                        if let Some(&b) = blocker {
                            states[i] = StepState::Skipped;
                            let now = Utc::now();
                            audit_trail.push(StepAudit {
                                step_id: spec.steps[i].id.clone(),
                                status: StepStatus::Skipped,
                                attempts: 0,
                                started_at: None,
                                finished_at: Some(now),
                                error: Some(format!(
                                    "dependency '{}' did not succeed",
                                    spec.steps[b].id
                                )),
                            });
                            tracing::debug!(
                                "[Workflow] {} → skipping step '{}'",
                                spec.name,
                                spec.steps[i].id
                            );
                        }
                    }
                }
            }
        }

        let outputs = compute_outputs(spec, &results);
        let finished_at = Utc::now();

        tracing::info!(
            "[Workflow] Finished '{}' ({}): {}/{} step(s) succeeded in {} ms",
            spec.name,
            execution_id,
            results.len(),
            spec.steps.len(),
            (finished_at - started_at).num_milliseconds()
        );

        Ok(WorkflowExecution {
            execution_id,
            workflow: spec.name.clone(),
            results,
            outputs,
            audit_trail,
            started_at,
            finished_at,
        })
    }
}

/// Audit every step still marked running once the run halts.
fn abort_running(
    spec: &WorkflowSpec,
    states: &[StepState],
    started: &[Option<DateTime<Utc>>],
    halted_by: &str,
    audit_trail: &mut Vec<StepAudit>,
) {
    let now = Utc::now();
    for (i, state) in states.iter().enumerate() {
        if *state != StepState::Running {
            continue;
        }
        tracing::warn!(
            "[Workflow] {} → aborting step '{}' after '{}' halted the run",
            spec.name,
            spec.steps[i].id,
            halted_by
        );
        audit_trail.push(StepAudit {
            step_id: spec.steps[i].id.clone(),
            status: StepStatus::Aborted,
            attempts: 0,
            started_at: started[i],
            finished_at: Some(now),
            error: Some(format!("aborted: '{}' halted the run", halted_by)),
        });
    }
}

fn correlation_value(context: &Value, key: &str) -> Result<String, AxonError> {
    match lookup_path(context, key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Null) | None => Err(AxonError::Configuration(format!(
            "persistence requires context key '{}'",
            key
        ))),
        Some(Value::String(_)) => Err(AxonError::Configuration(format!(
            "persistence context key '{}' is empty",
            key
        ))),
        Some(other) => Ok(other.to_string()),
    }
}

fn compute_outputs(spec: &WorkflowSpec, results: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut outputs = BTreeMap::new();
    for (name, out) in &spec.outputs {
        let Some(result) = results.get(&out.step) else {
            continue;
        };
        let value = match &out.path {
            Some(path) => match lookup_path(result, path) {
                Some(v) => v,
                None => {
                    tracing::debug!(
                        "[Workflow] {} → output '{}': path '{}' not found in '{}'",
                        spec.name,
                        name,
                        path,
                        out.step
                    );
                    continue;
                }
            },
            None => result,
        };
        match out.transform.apply(value) {
            Ok(v) => {
                outputs.insert(name.clone(), v);
            }
            Err(e) => {
                tracing::warn!("[Workflow] {} → output '{}': {}", spec.name, name, e);
            }
        }
    }
    outputs
}

async fn run_step(
    index: usize,
    step: StepSpec,
    action: Arc<dyn Action>,
    env: StepEnv,
    max_backoff: Duration,
    execution_id: String,
    snapshot: Option<(Arc<dyn SnapshotStore>, SnapshotContext)>,
) -> StepOutcome {
    let started_at = Utc::now();

    if let Some((store, ctx)) = &snapshot {
        if let Err(e) = store.snapshot_before(&execution_id, ctx).await {
            tracing::warn!("[Workflow] snapshot before '{}' failed: {}", step.id, e);
        }
    }

    let max_attempts = step.retry.max_attempts.max(1);
    let mut attempts = 0;
    let result = loop {
        attempts += 1;
        match attempt(&step, action.as_ref(), &env).await {
            Ok(v) => break Ok(v),
            Err(e) if attempts >= max_attempts => break Err(e),
            Err(e) => {
                let delay = step.retry.delay_after(attempts, max_backoff);
                tracing::warn!(
                    "[Workflow] step '{}' attempt {}/{} failed: {} (retrying in {:?})",
                    step.id,
                    attempts,
                    max_attempts,
                    e,
                    delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    };

    let result = result.map_err(|e| match e {
        AxonError::Timeout(msg) => AxonError::Timeout(format!("step '{}': {}", step.id, msg)),
        other => AxonError::StepExecution {
            step: step.id.clone(),
            attempts,
            message: match other {
                AxonError::StepExecution { message, .. } => message,
                o => o.to_string(),
            },
        },
    });

    let audit = StepAudit {
        step_id: step.id.clone(),
        status: if result.is_ok() {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        },
        attempts,
        started_at: Some(started_at),
        finished_at: Some(Utc::now()),
        error: result.as_ref().err().map(|e| e.to_string()),
    };

    if let Some((store, ctx)) = &snapshot {
        if let Err(e) = store.snapshot_after(&execution_id, &audit, ctx).await {
            tracing::warn!("[Workflow] snapshot after '{}' failed: {}", step.id, e);
        }
    }

    StepOutcome { index, audit, result }
}

/// One attempt: resolve params, run the action, honor the step deadline.
async fn attempt(step: &StepSpec, action: &dyn Action, env: &StepEnv) -> Result<Value, AxonError> {
    let params = match &step.params {
        Params::Value(v) => resolve_value(v, env),
        Params::Dynamic(f) => f(env),
    }
    .map_err(|message| AxonError::StepExecution {
        step: step.id.clone(),
        attempts: 0,
        message: format!("params: {}", message),
    })?;

    let run = action.run(params, env);
    let out = match step.timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), run)
            .await
            .map_err(|_| AxonError::Timeout(format!("attempt exceeded {} ms", ms)))?,
        None => run.await,
    };

    out.map_err(|message| AxonError::StepExecution {
        step: step.id.clone(),
        attempts: 0,
        message,
    })
}
