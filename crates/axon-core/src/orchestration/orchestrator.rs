//! Orchestrator worker - classify, spawn, collect, negotiate, aggregate.
//!
//! One worker per orchestrator configuration. It receives its request and
//! result signals through its mailbox and owns every `TaskState` it creates,
//! so results for the same task are always applied one at a time.
//!
//! For each request:
//!   1. classify the payload through a one-step workflow (retried and audited
//!      like any other step)
//!   2. pick the specialists from `spawn_specialists`, or ask the strategy
//!   3. get-or-spawn each specialist and hand it the request
//!   4. collect results, negotiating whenever a result disagrees with one
//!      already recorded
//!   5. aggregate once nobody is pending, or when the task deadline passes,
//!      and publish the summary
//!
//! Classification runs on its own tokio task and reports back through a
//! channel, so retry backoff for one request never holds up results or
//! deadlines of the others.
//!
//! Results for a task that has already been summarized are dropped and
//! logged. The worker remembers the most recent closed task ids for this.
//!
//! On `Shutdown` every open task is summarized as timed out, with its
//! unanswered specialists listed as missing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::config::{OrchestrationSpec, ResolvedAgent};
use super::specialist::spawn_specialist;
use super::strategy::{classification_label, OrchestrationStrategy};
use super::task::TaskState;
use crate::agents::{AgentHandle, AgentKind, AgentMessage};
use crate::error::AxonError;
use crate::events::Signal;
use crate::state::AxonState;
use crate::workflow::{Action, ActionRegistry, StepEnv, StepSpec, WorkflowEngine, WorkflowSpec};

const CLASSIFY_STEP: &str = "classify";

/// Everything an orchestrator worker needs besides the shared state.
#[derive(Debug, Clone)]
pub struct OrchestratorPlan {
    pub agent: ResolvedAgent,
    /// Specialists this orchestrator may spawn, by id
    pub specialists: BTreeMap<String, ResolvedAgent>,
    /// Number of open tasks, kept current by the worker
    pub active_tasks: Arc<AtomicUsize>,
}

impl OrchestratorPlan {
    pub fn new(agent: ResolvedAgent) -> Self {
        Self {
            agent,
            specialists: BTreeMap::new(),
            active_tasks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_specialist(mut self, specialist: ResolvedAgent) -> Self {
        self.specialists.insert(specialist.id().to_string(), specialist);
        self
    }
}

struct ClassifyAction {
    strategy: Arc<dyn OrchestrationStrategy>,
}

#[async_trait]
impl Action for ClassifyAction {
    async fn run(&self, params: Value, _env: &StepEnv) -> Result<Value, String> {
        self.strategy.classify(&params)
    }
}

/// Bind the strategies named by `plan.agent` and spawn the worker.
pub fn spawn_orchestrator(state: AxonState, plan: OrchestratorPlan) -> Result<AgentHandle, AxonError> {
    let id = plan.agent.id().to_string();
    let spec = plan.agent.orchestration();

    let classifier = state.strategies.get(&spec.classify_fn)?;
    let aggregator = state.strategies.get(&spec.aggregation_fn)?;
    let negotiator = state.strategies.get(&spec.negotiate_fn)?;

    let actions = ActionRegistry::new();
    actions.register(
        CLASSIFY_STEP,
        Arc::new(ClassifyAction {
            strategy: classifier.clone(),
        }),
    )?;
    let engine = state.engine.with_actions(Arc::new(actions));
    let classify_workflow = WorkflowSpec::new(format!("classify:{}", id)).step(
        StepSpec::new(CLASSIFY_STEP, CLASSIFY_STEP)
            .with_params(Value::String("${input}".to_string()))
            .with_retry(spec.classify_retry.clone()),
    );

    let timeout = Duration::from_millis(
        spec.timeout_ms
            .unwrap_or(state.settings.orchestration.task_timeout_ms),
    );
    let closed_capacity = state.settings.orchestration.closed_task_memory.max(1);
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let (classified_tx, classified_rx) = mpsc::unbounded_channel();

    let worker = Orchestrator {
        state,
        agent: plan.agent,
        spec,
        classifier,
        aggregator,
        negotiator,
        engine,
        classify_workflow,
        specialists: plan.specialists,
        timeout,
        tasks: HashMap::new(),
        classifying: HashMap::new(),
        closed: VecDeque::new(),
        closed_set: HashSet::new(),
        closed_capacity,
        active_tasks: plan.active_tasks,
        timer_tx,
        classified_tx,
    };

    Ok(AgentHandle::spawn(id, AgentKind::Orchestrator, move |rx| {
        worker.run(rx, timer_rx, classified_rx)
    }))
}

struct OpenTask {
    state: TaskState,
    timer: AbortHandle,
}

/// Outcome of a classification run, sent back to the worker.
struct Classified {
    request: Signal,
    outcome: Result<Value, String>,
    attempts: u32,
}

struct Orchestrator {
    state: AxonState,
    agent: ResolvedAgent,
    spec: OrchestrationSpec,
    classifier: Arc<dyn OrchestrationStrategy>,
    aggregator: Arc<dyn OrchestrationStrategy>,
    negotiator: Arc<dyn OrchestrationStrategy>,
    engine: WorkflowEngine,
    classify_workflow: WorkflowSpec,
    specialists: BTreeMap<String, ResolvedAgent>,
    timeout: Duration,
    tasks: HashMap<String, OpenTask>,
    /// Requests whose classification is still running
    classifying: HashMap<String, AbortHandle>,
    closed: VecDeque<String>,
    closed_set: HashSet<String>,
    closed_capacity: usize,
    active_tasks: Arc<AtomicUsize>,
    timer_tx: mpsc::UnboundedSender<String>,
    classified_tx: mpsc::UnboundedSender<Classified>,
}

impl Orchestrator {
    fn id(&self) -> &str {
        self.agent.id()
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<AgentMessage>,
        mut timers: mpsc::UnboundedReceiver<String>,
        mut classified: mpsc::UnboundedReceiver<Classified>,
    ) {
        tracing::info!(
            "[Orchestrator] {} started (timeout {:?}, {} known specialist(s))",
            self.id(),
            self.timeout,
            self.specialists.len()
        );

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(AgentMessage::Signal(signal)) => self.on_signal(signal).await,
                    Some(AgentMessage::Shutdown) | None => break,
                },
                Some(task_id) = timers.recv() => self.on_timeout(&task_id).await,
                Some(done) = classified.recv() => self.on_classified(done).await,
            }
        }

        // classifications that already finished still get their specialists recorded
        while let Ok(done) = classified.try_recv() {
            self.on_classified(done).await;
        }
        let drained = self.drain().await;
        self.active_tasks.store(0, Ordering::SeqCst);
        if drained > 0 {
            tracing::warn!(
                "[Orchestrator] {} stopped after summarizing {} open task(s)",
                self.id(),
                drained
            );
        } else {
            tracing::info!("[Orchestrator] {} stopped", self.id());
        }
    }

    /// Summarize every task still open or classifying.
    async fn drain(&mut self) -> usize {
        let mut unclassified: Vec<(String, AbortHandle)> = self.classifying.drain().collect();
        unclassified.sort_by(|a, b| a.0.cmp(&b.0));
        let mut open: Vec<(String, OpenTask)> = self.tasks.drain().collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        let count = unclassified.len() + open.len();

        for (task_id, run) in unclassified {
            run.abort();
            let mut task = TaskState::new(task_id, self.id(), Value::Null).decide("request");
            task.metadata.error = Some("orchestrator stopped before classification finished".to_string());
            self.finalize(task.decide("shutdown").time_out()).await;
        }
        for (_, task) in open {
            task.timer.abort();
            self.finalize(task.state.decide("shutdown").time_out()).await;
        }
        count
    }

    fn open_count(&self) -> usize {
        self.tasks.len() + self.classifying.len()
    }

    async fn on_signal(&mut self, signal: Signal) {
        let is_request = signal.wire_type() == self.agent.roles.request.wire_type;
        let is_result = signal.wire_type() == self.agent.roles.result.wire_type;
        if is_request {
            self.on_request(signal).await;
        } else if is_result {
            self.on_result(signal).await;
        } else {
            tracing::debug!(
                "[Orchestrator] {} ignoring {} ({})",
                self.id(),
                signal.id(),
                signal.wire_type()
            );
        }
    }

    // ─── Requests ──────────────────────────────────────────────────────

    async fn on_request(&mut self, signal: Signal) {
        let task_id = signal.correlation_id().to_string();
        if self.tasks.contains_key(&task_id)
            || self.classifying.contains_key(&task_id)
            || self.closed_set.contains(&task_id)
        {
            tracing::warn!(
                "[Orchestrator] {} ignoring duplicate request for task {}",
                self.id(),
                task_id
            );
            return;
        }

        let engine = self.engine.clone();
        let workflow = self.classify_workflow.clone();
        let context = json!({
            "agent_id": self.id(),
            "task_id": task_id,
            "source": signal.source(),
        });
        let tx = self.classified_tx.clone();
        let run = tokio::spawn(async move {
            let (outcome, attempts) = classify(&engine, &workflow, &signal, context).await;
            let _ = tx.send(Classified {
                request: signal,
                outcome,
                attempts,
            });
        });
        self.classifying.insert(task_id, run.abort_handle());
        self.active_tasks.store(self.open_count(), Ordering::SeqCst);
    }

    async fn on_classified(&mut self, done: Classified) {
        let Classified {
            request: signal,
            outcome,
            attempts,
        } = done;
        let task_id = signal.correlation_id().to_string();
        if self.classifying.remove(&task_id).is_none() {
            return;
        }

        let mut task = TaskState::new(task_id.clone(), self.id(), Value::Null).decide("request");
        task.metadata.classify_attempts = attempts;

        let classification = match outcome {
            Ok(classification) => classification,
            Err(e) => {
                tracing::error!(
                    "[Orchestrator] {} could not classify task {}: {}",
                    self.id(),
                    task_id,
                    e
                );
                task.metadata.error = Some(e);
                self.finalize(task.decide("classify_failed")).await;
                return;
            }
        };

        let label = classification_label(&classification).to_string();
        let mut wanted = match &self.spec.spawn_specialists {
            Some(spawn) => spawn.for_label(&label),
            None => {
                let available: Vec<String> = self.specialists.keys().cloned().collect();
                self.classifier.specialists(&classification, &available)
            }
        };
        let mut seen = HashSet::new();
        wanted.retain(|id| seen.insert(id.clone()));

        task.classification = classification;
        let mut task = task
            .decide(format!("classified:{}", label))
            .with_specialists(&wanted);

        if wanted.is_empty() {
            tracing::debug!(
                "[Orchestrator] {} task {} needs no specialists",
                self.id(),
                task_id
            );
            self.finalize(task.decide("fast_path")).await;
            return;
        }

        task = task.decide(format!("spawn:{}", wanted.join(",")));
        for specialist_id in &wanted {
            if let Err(e) = self.dispatch(specialist_id, &signal).await {
                tracing::warn!(
                    "[Orchestrator] {} could not reach {} for task {}: {}",
                    self.id(),
                    specialist_id,
                    task_id,
                    e
                );
                task = task.record_failure(specialist_id, e.kind());
            }
        }

        if task.is_complete() {
            self.finalize(task).await;
            return;
        }

        let timer = self.start_timer(&task_id);
        self.tasks.insert(task_id.clone(), OpenTask { state: task, timer });
        self.active_tasks.store(self.open_count(), Ordering::SeqCst);
        tracing::debug!(
            "[Orchestrator] {} opened task {} ({} specialist(s))",
            self.id(),
            task_id,
            wanted.len()
        );
    }

    async fn dispatch(&self, specialist_id: &str, request: &Signal) -> Result<(), AxonError> {
        let agent = self
            .specialists
            .get(specialist_id)
            .cloned()
            .ok_or_else(|| AxonError::NotFound(format!("specialist '{}'", specialist_id)))?;
        let handle = self
            .state
            .agents
            .get_or_spawn(specialist_id, (self.state.clone(), agent), |(state, agent)| async move {
                Ok(spawn_specialist(state, agent))
            })
            .await?;
        handle.send(AgentMessage::Signal(request.clone()))
    }

    fn start_timer(&self, task_id: &str) -> AbortHandle {
        let tx = self.timer_tx.clone();
        let task_id = task_id.to_string();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(task_id);
        })
        .abort_handle()
    }

    // ─── Results ───────────────────────────────────────────────────────

    async fn on_result(&mut self, signal: Signal) {
        let mut result = signal.data().clone();
        let task_id = signal
            .subject()
            .or_else(|| result.get("task_id").and_then(Value::as_str))
            .map(str::to_string);
        let Some(task_id) = task_id else {
            tracing::warn!(
                "[Orchestrator] {} dropping result {} without a task id",
                self.id(),
                signal.id()
            );
            return;
        };
        let agent_id = TaskState::agent_of(&result)
            .unwrap_or(signal.source())
            .to_string();

        let Some(open) = self.tasks.remove(&task_id) else {
            if self.closed_set.contains(&task_id) {
                tracing::warn!(
                    "[Orchestrator] {} dropping late result from {} for closed task {}",
                    self.id(),
                    agent_id,
                    task_id
                );
            } else {
                tracing::debug!(
                    "[Orchestrator] {} ignoring result for unknown task {}",
                    self.id(),
                    task_id
                );
            }
            return;
        };

        if !open.state.is_pending(&agent_id) {
            tracing::warn!(
                "[Orchestrator] {} dropping unexpected result from {} for task {}",
                self.id(),
                agent_id,
                task_id
            );
            self.tasks.insert(task_id, open);
            return;
        }

        if let Value::Object(map) = &mut result {
            map.entry("agent_id".to_string())
                .or_insert_with(|| Value::String(agent_id.clone()));
        }

        let mut task = open.state;
        if !task.conflicts_with(&result).is_empty() {
            task = self
                .negotiator
                .negotiate(&result, task)
                .decide(format!("negotiate:{}", agent_id));
        }
        let task = task.record_result(&agent_id, result);

        if task.is_complete() {
            open.timer.abort();
            self.finalize(task).await;
        } else {
            self.tasks.insert(
                task_id,
                OpenTask {
                    state: task,
                    timer: open.timer,
                },
            );
        }
    }

    async fn on_timeout(&mut self, task_id: &str) {
        let Some(open) = self.tasks.remove(task_id) else {
            return;
        };
        let task = open.state.time_out();
        tracing::warn!(
            "[Orchestrator] {} task {} timed out after {:?}; missing {:?}",
            self.id(),
            task_id,
            self.timeout,
            task.metadata.missing
        );
        self.finalize(task).await;
    }

    // ─── Summary ───────────────────────────────────────────────────────

    async fn finalize(&mut self, task: TaskState) {
        let task = task.decide("aggregate").finish();
        let task_id = task.task_id.clone();

        let summary = match self.aggregator.aggregate(&task.results, &task) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(
                    "[Orchestrator] {} aggregation failed for task {}: {}",
                    self.id(),
                    task_id,
                    e
                );
                json!({ "results": task.results.clone(), "error": e })
            }
        };
        let mut payload = match summary {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("summary".to_string(), other);
                map
            }
        };
        payload.insert("task_id".to_string(), Value::String(task_id.clone()));
        payload.insert(
            "metadata".to_string(),
            serde_json::to_value(&task.metadata).unwrap_or(Value::Null),
        );

        self.remember_closed(&task_id);
        self.active_tasks.store(self.open_count(), Ordering::SeqCst);

        let Some(summary_role) = &self.agent.roles.summary else {
            tracing::error!("[Orchestrator] {} has no summary topic", self.id());
            return;
        };
        let signal = Signal::new(summary_role.wire_type.clone(), Value::Object(payload))
            .with_subject(task_id.clone())
            .with_source(self.id());
        match self.state.event_bus.publish(signal).await {
            Ok(report) => tracing::info!(
                "[Orchestrator] {} emitted summary for task {} ({} result(s), {} recipient(s))",
                self.id(),
                task_id,
                task.results.len(),
                report.recipients()
            ),
            Err(e) => tracing::error!(
                "[Orchestrator] {} could not publish summary for task {}: {}",
                self.id(),
                task_id,
                e
            ),
        }
    }

    fn remember_closed(&mut self, task_id: &str) {
        if self.closed_set.insert(task_id.to_string()) {
            self.closed.push_back(task_id.to_string());
        }
        while self.closed.len() > self.closed_capacity {
            if let Some(old) = self.closed.pop_front() {
                self.closed_set.remove(&old);
            }
        }
    }
}

/// Run the classification workflow; returns the classification and the
/// attempts it took.
async fn classify(
    engine: &WorkflowEngine,
    workflow: &WorkflowSpec,
    request: &Signal,
    context: Value,
) -> (Result<Value, String>, u32) {
    match engine.execute(workflow, request.data().clone(), context).await {
        Ok(execution) => {
            let attempts = execution
                .audit(CLASSIFY_STEP)
                .map(|a| a.attempts)
                .unwrap_or(1);
            let classification = execution
                .results
                .get(CLASSIFY_STEP)
                .cloned()
                .unwrap_or(Value::Null);
            (Ok(classification), attempts)
        }
        Err(failure) => (Err(failure.error.to_string()), failure.attempts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::config::{resolve_configs, AgentConfig, SpawnSpecialists};
    use crate::state::AxonStateInner;
    use crate::topics::{FieldSpec, FieldType};
    use tokio_stream::StreamExt;

    fn setup(spawn: SpawnSpecialists) -> (AxonState, OrchestratorPlan) {
        let state = Arc::new(AxonStateInner::default());
        state
            .topics
            .register("job_request", "job.request", vec![FieldSpec::optional("label", FieldType::String)])
            .unwrap();
        state.topics.register("job_result", "job.result", vec![]).unwrap();
        state.topics.register("job_summary", "job.summary", vec![]).unwrap();
        state
            .actions
            .register_fn("echo", |params, _| async move { Ok(json!({"seen": params})) })
            .unwrap();

        let worker = AgentConfig::specialist("worker")
            .with_actions(["echo"])
            .subscribes(["job_request"])
            .emits(["job_result"]);
        let boss = AgentConfig::orchestrator(
            "boss",
            OrchestrationSpec {
                spawn_specialists: Some(spawn),
                ..OrchestrationSpec::default()
            },
        )
        .subscribes(["job_request", "job_result"])
        .emits(["job_summary"]);

        let mut resolved = resolve_configs(&[worker, boss], &state.topics, &state.actions, &state.strategies).unwrap();
        let boss = resolved.pop().unwrap();
        let worker = resolved.pop().unwrap();
        (state, OrchestratorPlan::new(boss).with_specialist(worker))
    }

    async fn wire(state: &AxonState, handle: &AgentHandle) {
        for wire_type in ["job.request", "job.result"] {
            state
                .event_bus
                .subscribe(
                    wire_type,
                    crate::events::DispatchTarget::Handler(Arc::new(handle.clone())),
                    crate::events::DispatchMode::Async,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_single_specialist_round_trip() {
        let (state, plan) = setup(SpawnSpecialists::Static(vec!["worker".to_string()]));
        let counter = plan.active_tasks.clone();
        let handle = spawn_orchestrator(state.clone(), plan).unwrap();
        wire(&state, &handle).await;
        let (_id, mut summaries) = state.event_bus.subscribe_stream("job.summary").await.unwrap();

        state
            .event_bus
            .publish(Signal::new("job.request", json!({"label": "x"})).with_subject("t-1"))
            .await
            .unwrap();

        let summary = summaries.next().await.unwrap();
        assert_eq!(summary.subject(), Some("t-1"));
        assert_eq!(summary.source(), "boss");
        assert_eq!(summary.data()["result_count"], 1);
        assert_eq!(summary.data()["results"][0]["agent_id"], "worker");
        assert_eq!(summary.data()["metadata"]["classify_attempts"], 1);
        assert!(state.agents.lookup("worker").await.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        handle.stop();
        state.agents.stop_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_request_is_ignored() {
        let (state, plan) = setup(SpawnSpecialists::Static(vec![]));
        let handle = spawn_orchestrator(state.clone(), plan).unwrap();
        wire(&state, &handle).await;
        let (_id, mut summaries) = state.event_bus.subscribe_stream("job.summary").await.unwrap();

        for _ in 0..2 {
            state
                .event_bus
                .publish(Signal::new("job.request", json!({})).with_subject("same"))
                .await
                .unwrap();
        }
        state
            .event_bus
            .publish(Signal::new("job.request", json!({})).with_subject("other"))
            .await
            .unwrap();

        // classifications run concurrently, so the two summaries may come in either order
        let mut subjects = Vec::new();
        for _ in 0..2 {
            subjects.push(summaries.next().await.unwrap().subject().unwrap().to_string());
        }
        subjects.sort();
        assert_eq!(subjects, vec!["other", "same"]);
        let again = tokio::time::timeout(Duration::from_millis(200), summaries.next()).await;
        assert!(again.is_err());
        handle.stop();
    }

    #[tokio::test]
    async fn test_unknown_specialist_is_recorded_as_failed() {
        let (state, plan) = setup(SpawnSpecialists::Static(vec![]));
        let mut plan = plan;
        plan.specialists.clear();
        let mut spec = plan.agent.orchestration();
        spec.spawn_specialists = Some(SpawnSpecialists::Static(vec!["ghost".to_string()]));
        let mut config = (*plan.agent.config).clone();
        config.orchestration = Some(spec);
        plan.agent.config = Arc::new(config);

        let handle = spawn_orchestrator(state.clone(), plan).unwrap();
        wire(&state, &handle).await;
        let (_id, mut summaries) = state.event_bus.subscribe_stream("job.summary").await.unwrap();
        state
            .event_bus
            .publish(Signal::new("job.request", json!({})).with_subject("t-ghost"))
            .await
            .unwrap();

        let summary = summaries.next().await.unwrap();
        assert_eq!(summary.data()["metadata"]["failed"], json!(["ghost"]));
        assert_eq!(summary.data()["result_count"], 0);
        handle.stop();
    }
}
