//! Orchestrator Runtime - turns a set of agent configurations into running
//! workers wired into the event bus.
//!
//! Applying a set:
//!   - every orchestrator is spawned and subscribed to its request and
//!     result wire types
//!   - a specialist that serves an orchestrator (same request topic, or named
//!     in its `spawn_specialists`) is spawned on demand by that orchestrator
//!   - every other specialist is spawned now and subscribed to its request
//!     wire type
//!
//! `reload` validates the whole new set before touching the running one. If
//! validation fails nothing changes; if wiring the new set fails the
//! previous set is brought back.
//!
//! Tearing a set down unsubscribes it first, then lets each orchestrator
//! summarize its open tasks (as timed out) before the workers are stopped.
//! A request published between the old set's teardown and the new set's
//! wiring has no subscriber; its publish report shows zero recipients.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::config::{resolve_configs, AgentConfig, ResolvedAgent};
use super::orchestrator::{spawn_orchestrator, OrchestratorPlan};
use super::specialist::spawn_specialist;
use crate::agents::AgentKind;
use crate::error::AxonError;
use crate::events::{DispatchMode, DispatchTarget};
use crate::state::AxonState;

#[derive(Default)]
struct ActiveSet {
    agents: Vec<ResolvedAgent>,
    subscriptions: Vec<String>,
    agent_ids: Vec<String>,
    task_counters: Vec<Arc<AtomicUsize>>,
}

pub struct OrchestratorRuntime {
    state: AxonState,
    active: Mutex<ActiveSet>,
}

impl OrchestratorRuntime {
    pub fn new(state: AxonState) -> Self {
        Self {
            state,
            active: Mutex::new(ActiveSet::default()),
        }
    }

    pub fn state(&self) -> &AxonState {
        &self.state
    }

    /// Apply the first configuration set. Topics, actions and strategies
    /// must be registered before this is called.
    pub async fn start(&self, configs: Vec<AgentConfig>) -> Result<(), AxonError> {
        self.reload(configs).await
    }

    /// Load every agent file in `dir` and apply the result as a reload.
    pub async fn reload_from_dir(&self, dir: &str) -> Result<(), AxonError> {
        let configs = AgentConfig::load_dir(dir)?;
        self.reload(configs).await
    }

    /// Replace the active configuration set with `configs`.
    pub async fn reload(&self, configs: Vec<AgentConfig>) -> Result<(), AxonError> {
        let mut active = self.active.lock().await;

        let resolved = resolve_configs(
            &configs,
            &self.state.topics,
            &self.state.actions,
            &self.state.strategies,
        )
        .map_err(|e| {
            tracing::warn!("[Runtime] Rejected configuration set: {}", e);
            e
        })?;

        let previous = std::mem::take(&mut *active);
        self.tear_down(&previous).await;

        match self.bring_up(&resolved).await {
            Ok(set) => {
                tracing::info!(
                    "[Runtime] Applied {} agent configuration(s) ({} subscription(s))",
                    set.agents.len(),
                    set.subscriptions.len()
                );
                *active = set;
                Ok(())
            }
            Err(e) => {
                tracing::error!("[Runtime] Could not apply configuration set: {}", e);
                match self.bring_up(&previous.agents).await {
                    Ok(set) => *active = set,
                    Err(restore) => {
                        tracing::error!("[Runtime] Could not restore previous set: {}", restore)
                    }
                }
                Err(e)
            }
        }
    }

    /// Configurations currently applied, in load order.
    pub async fn active_configs(&self) -> Vec<Arc<AgentConfig>> {
        self.active
            .lock()
            .await
            .agents
            .iter()
            .map(|a| a.config.clone())
            .collect()
    }

    /// Tasks currently open across every orchestrator.
    pub async fn active_task_count(&self) -> usize {
        self.active
            .lock()
            .await
            .task_counters
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }

    /// Unsubscribe and stop everything the active set started.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        let previous = std::mem::take(&mut *active);
        self.tear_down(&previous).await;
        tracing::info!("[Runtime] Shut down {} agent(s)", previous.agent_ids.len());
    }

    async fn bring_up(&self, agents: &[ResolvedAgent]) -> Result<ActiveSet, AxonError> {
        let mut set = ActiveSet {
            agents: agents.to_vec(),
            ..ActiveSet::default()
        };
        match self.wire(agents, &mut set).await {
            Ok(()) => Ok(set),
            Err(e) => {
                self.tear_down(&set).await;
                Err(e)
            }
        }
    }

    async fn wire(&self, agents: &[ResolvedAgent], set: &mut ActiveSet) -> Result<(), AxonError> {
        let bus = &self.state.event_bus;
        let (orchestrators, specialists): (Vec<&ResolvedAgent>, Vec<&ResolvedAgent>) = agents
            .iter()
            .partition(|a| a.config.kind == AgentKind::Orchestrator);

        let mut on_demand: HashSet<&str> = HashSet::new();
        for orchestrator in orchestrators {
            let mut plan = OrchestratorPlan::new(orchestrator.clone());
            for specialist in specialists.iter().filter(|s| serves(orchestrator, s)) {
                on_demand.insert(specialist.id());
                plan = plan.with_specialist((*specialist).clone());
            }
            set.task_counters.push(plan.active_tasks.clone());
            set.agent_ids.push(orchestrator.id().to_string());

            let handle = self
                .state
                .agents
                .get_or_spawn(orchestrator.id(), (self.state.clone(), plan), |(state, plan)| async move {
                    spawn_orchestrator(state, plan)
                })
                .await?;
            for wire_type in [
                &orchestrator.roles.request.wire_type,
                &orchestrator.roles.result.wire_type,
            ] {
                let sub = bus
                    .subscribe(
                        wire_type,
                        DispatchTarget::Handler(Arc::new(handle.clone())),
                        DispatchMode::Async,
                    )
                    .await?;
                set.subscriptions.push(sub);
            }
        }

        for specialist in specialists {
            set.agent_ids.push(specialist.id().to_string());
            if on_demand.contains(specialist.id()) {
                tracing::debug!("[Runtime] {} will be spawned on demand", specialist.id());
                continue;
            }
            let handle = self
                .state
                .agents
                .get_or_spawn(
                    specialist.id(),
                    (self.state.clone(), specialist.clone()),
                    |(state, agent)| async move { Ok(spawn_specialist(state, agent)) },
                )
                .await?;
            let sub = bus
                .subscribe(
                    &specialist.roles.request.wire_type,
                    DispatchTarget::Handler(Arc::new(handle)),
                    DispatchMode::Async,
                )
                .await?;
            set.subscriptions.push(sub);
        }
        Ok(())
    }

    async fn tear_down(&self, set: &ActiveSet) {
        for sub in &set.subscriptions {
            if let Err(e) = self.state.event_bus.unsubscribe(sub).await {
                tracing::debug!("[Runtime] {}", e);
            }
        }
        let grace = self.state.settings.drain_timeout();
        for id in &set.agent_ids {
            let Ok(handle) = self.state.agents.lookup(id).await else {
                continue;
            };
            if handle.kind() == AgentKind::Orchestrator && !handle.drain(grace).await {
                tracing::warn!("[Runtime] {} did not drain within {:?}", id, grace);
            }
        }
        for id in &set.agent_ids {
            // on-demand specialists may never have been spawned
            if self.state.agents.stop(id).await.is_ok() {
                tracing::debug!("[Runtime] Stopped {}", id);
            }
        }
    }
}

/// Whether `orchestrator` hands its requests to `specialist`.
fn serves(orchestrator: &ResolvedAgent, specialist: &ResolvedAgent) -> bool {
    if specialist.roles.request.topic == orchestrator.roles.request.topic {
        return true;
    }
    orchestrator
        .config
        .orchestration
        .as_ref()
        .and_then(|o| o.spawn_specialists.as_ref())
        .map(|spawn| spawn.all_ids().iter().any(|id| id.as_str() == specialist.id()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Signal;
    use crate::orchestration::config::OrchestrationSpec;
    use crate::state::AxonStateInner;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn state() -> AxonState {
        let state = Arc::new(AxonStateInner::default());
        for (name, wire) in [
            ("lint_request", "lint.request"),
            ("lint_result", "lint.result"),
            ("lint_summary", "lint.summary"),
            ("ping_request", "ping.request"),
            ("ping_result", "ping.result"),
        ] {
            state.topics.register(name, wire, vec![]).unwrap();
        }
        state
            .actions
            .register_fn("noop", |_, _| async { Ok(json!({"outcome": "pass"})) })
            .unwrap();
        state
    }

    fn configs() -> Vec<AgentConfig> {
        vec![
            AgentConfig::specialist("linter")
                .with_actions(["noop"])
                .subscribes(["lint_request"])
                .emits(["lint_result"]),
            AgentConfig::specialist("pinger")
                .with_actions(["noop"])
                .subscribes(["ping_request"])
                .emits(["ping_result"]),
            AgentConfig::orchestrator("lead", OrchestrationSpec::default())
                .subscribes(["lint_request", "lint_result"])
                .emits(["lint_summary"]),
        ]
    }

    #[tokio::test]
    async fn test_start_wires_agents() {
        let runtime = OrchestratorRuntime::new(state());
        runtime.start(configs()).await.unwrap();
        let state = runtime.state().clone();

        // lead + pinger now, linter on demand
        assert!(state.agents.lookup("lead").await.is_ok());
        assert!(state.agents.lookup("pinger").await.is_ok());
        assert!(state.agents.lookup("linter").await.is_err());
        assert_eq!(state.event_bus.subscription_count().await, 3);

        let (_id, mut pings) = state.event_bus.subscribe_stream("ping.result").await.unwrap();
        state
            .event_bus
            .publish(Signal::new("ping.request", json!({})))
            .await
            .unwrap();
        assert_eq!(pings.next().await.unwrap().data()["agent_id"], "pinger");

        let (_id, mut summaries) = state.event_bus.subscribe_stream("lint.summary").await.unwrap();
        state
            .event_bus
            .publish(Signal::new("lint.request", json!({})).with_subject("l-1"))
            .await
            .unwrap();
        let summary = summaries.next().await.unwrap();
        assert_eq!(summary.data()["results"][0]["agent_id"], "linter");
        assert!(state.agents.lookup("linter").await.is_ok());
        assert_eq!(runtime.active_task_count().await, 0);

        runtime.shutdown().await;
        assert!(state.agents.is_empty().await);
    }

    #[tokio::test]
    async fn test_reload_replaces_set() {
        let runtime = OrchestratorRuntime::new(state());
        runtime.start(configs()).await.unwrap();
        runtime.reload(configs()[1..2].to_vec()).await.unwrap();

        let ids: Vec<String> = runtime
            .active_configs()
            .await
            .iter()
            .map(|c| c.id.clone())
            .collect();
        assert_eq!(ids, vec!["pinger"]);
        assert!(runtime.state().agents.lookup("lead").await.is_err());
        assert_eq!(runtime.state().event_bus.subscription_count().await, 1);
        runtime.shutdown().await;
    }
}
