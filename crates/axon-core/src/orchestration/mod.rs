//! Orchestration - declarative agents turned into running workers.
//!
//! - `config` - agent configurations, loading and validation
//! - `strategy` - `classify_fn` / `aggregation_fn` / `negotiate_fn` behavior
//! - `task` - per-request task state owned by an orchestrator
//! - `specialist` / `orchestrator` - the two worker kinds
//! - `runtime` - applies and reloads a configuration set

pub mod config;
pub mod orchestrator;
pub mod runtime;
pub mod specialist;
pub mod strategy;
pub mod task;

pub use config::{
    resolve_configs, AgentConfig, OrchestrationSpec, ResolvedAgent, ResolvedRoles, RoleBinding,
    SignalBindings, SpawnSpecialists,
};
pub use orchestrator::{spawn_orchestrator, OrchestratorPlan};
pub use runtime::OrchestratorRuntime;
pub use specialist::spawn_specialist;
pub use strategy::{
    default_classify, DefaultStrategy, OrchestrationStrategy, SeverityStrategy, StrategyRegistry, DEFAULT_STRATEGY,
    SEVERITY_STRATEGY,
};
pub use task::{NegotiationRecord, TaskMetadata, TaskState};
