//! Core error type for the Axon runtime.
//!
//! `AxonError` is shared by the topic registry, the event bus, the workflow
//! engine, the agent registry and the orchestrator runtime. Validation and
//! configuration errors are returned to the caller that triggered them;
//! step and timeout errors end up in audit trails and task metadata.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AxonError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
    StepExecution {
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AxonError {
    /// Short machine-readable kind, used when errors are recorded in JSON
    /// audit trails and task metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            AxonError::Validation(_) => "validation",
            AxonError::NotFound(_) => "not_found",
            AxonError::AlreadyRegistered(_) => "already_registered",
            AxonError::StepExecution { .. } => "step_execution",
            AxonError::Configuration(_) => "configuration",
            AxonError::Timeout(_) => "timeout",
            AxonError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for AxonError {
    fn from(e: serde_json::Error) -> Self {
        AxonError::Internal(format!("JSON error: {}", e))
    }
}
