//! Workflow Engine - declared step DAGs with retries and an audit trail.
//!
//! - `schema` - `WorkflowSpec`, `StepSpec` and friends (YAML or builders)
//! - `template` - `${...}` resolution of step params
//! - `action` - the `Action` trait and the name → action registry
//! - `executor` - `WorkflowEngine`, ordering, retries, `on_error`, outputs
//! - `persistence` - before/after step snapshots

pub mod action;
pub mod executor;
pub mod persistence;
pub mod schema;
pub mod template;

pub use action::{action_fn, Action, ActionRegistry};
pub use executor::{
    PersistenceConfig, StepAudit, StepStatus, WorkflowEngine, WorkflowExecution, WorkflowFailure,
};
pub use persistence::{
    JsonlSnapshotStore, MemorySnapshotStore, SnapshotContext, SnapshotPhase, SnapshotRecord,
    SnapshotStore,
};
pub use schema::{
    Backoff, OnError, OutputSpec, OutputTransform, Params, RetryPolicy, StepSpec, WorkflowSpec,
};
pub use template::StepEnv;
