//! Shared runtime state handed to every worker.

use std::sync::Arc;

use crate::agents::AgentRegistry;
use crate::config::RuntimeSettings;
use crate::events::EventBus;
use crate::orchestration::StrategyRegistry;
use crate::topics::TopicRegistry;
use crate::workflow::{ActionRegistry, WorkflowEngine};

/// Registries and services shared by the bus, the engine and the agents.
pub struct AxonStateInner {
    pub topics: Arc<TopicRegistry>,
    pub event_bus: EventBus,
    pub agents: AgentRegistry,
    pub actions: Arc<ActionRegistry>,
    pub strategies: StrategyRegistry,
    pub engine: WorkflowEngine,
    pub settings: RuntimeSettings,
}

pub type AxonState = Arc<AxonStateInner>;

impl AxonStateInner {
    pub fn new(settings: RuntimeSettings) -> Self {
        let topics = Arc::new(TopicRegistry::new());
        let actions = Arc::new(ActionRegistry::new());
        Self {
            event_bus: EventBus::new(topics.clone(), settings.bus.clone()),
            agents: AgentRegistry::new(),
            engine: WorkflowEngine::new(actions.clone(), settings.workflow.clone()),
            strategies: StrategyRegistry::new(),
            topics,
            actions,
            settings,
        }
    }

    /// Same as `new`, with the workflow engine adjusted by `engine`
    /// (for example to attach a snapshot store).
    pub fn with_engine(settings: RuntimeSettings, engine: impl FnOnce(WorkflowEngine) -> WorkflowEngine) -> Self {
        let mut state = Self::new(settings);
        state.engine = engine(state.engine);
        state
    }
}

impl Default for AxonStateInner {
    fn default() -> Self {
        Self::new(RuntimeSettings::default())
    }
}
