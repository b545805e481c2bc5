//! Axon Core - typed events, DAG workflows and config-driven orchestration.
//!
//! The crate is organized leaves first:
//!
//! - `topics` - topic → (wire type, schema) bindings and payload validation
//! - `events` - signals and the publish/subscribe bus
//! - `workflow` - step DAG execution with retries and an audit trail
//! - `agents` - idempotent get-or-spawn registry of worker tasks
//! - `orchestration` - specialists and orchestrators built from declarative
//!   configurations
//!
//! Nothing here installs a `tracing` subscriber; that is left to the host.

pub mod agents;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestration;
pub mod state;
pub mod topics;
pub mod workflow;

// Convenience re-exports
pub use config::RuntimeSettings;
pub use error::AxonError;
pub use events::{EventBus, Signal};
pub use orchestration::{AgentConfig, OrchestratorRuntime};
pub use state::{AxonState, AxonStateInner};
pub use topics::{FieldSpec, FieldType, Topic, TopicRegistry};
pub use workflow::{WorkflowEngine, WorkflowSpec};
