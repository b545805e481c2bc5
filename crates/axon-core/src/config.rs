//! Runtime settings - tunables for the bus, the workflow engine and the
//! orchestrator runtime.
//!
//! Settings can be written in YAML:
//!
//! ```yaml
//! bus:
//!   max_concurrent_deliveries: 32
//!   sync_timeout_ms: 2000
//!   replay_capacity: 5000
//! workflow:
//!   max_backoff_ms: 10000
//! orchestration:
//!   task_timeout_ms: 30000
//! ```
//!
//! Every field has a default, so an empty document is valid. Environment
//! variables override file values via [`RuntimeSettings::with_env_overrides`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AxonError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub workflow: WorkflowSettings,

    #[serde(default)]
    pub orchestration: OrchestrationSettings,
}

/// Event bus tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Upper bound on asynchronous deliveries running at the same time.
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// How long a synchronous publish waits for each destination.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Number of published events retained for replay.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            sync_timeout_ms: default_sync_timeout_ms(),
            replay_capacity: default_replay_capacity(),
        }
    }
}

fn default_max_concurrent_deliveries() -> usize {
    64
}

fn default_sync_timeout_ms() -> u64 {
    5_000
}

fn default_replay_capacity() -> usize {
    10_000
}

/// Workflow engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Cap applied to every computed retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Orchestrator runtime tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSettings {
    /// Deadline after which a task is force-aggregated.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// How many closed task ids each orchestrator remembers in order to
    /// recognize late results.
    #[serde(default = "default_closed_task_memory")]
    pub closed_task_memory: usize,

    /// How long a reload or shutdown waits for an orchestrator to summarize
    /// its open tasks before stopping it.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            task_timeout_ms: default_task_timeout_ms(),
            closed_task_memory: default_closed_task_memory(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_task_timeout_ms() -> u64 {
    60_000
}

fn default_closed_task_memory() -> usize {
    1_024
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

impl RuntimeSettings {
    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, AxonError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| AxonError::Configuration(format!("Failed to parse settings YAML: {}", e)))
    }

    /// Load settings from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, AxonError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AxonError::Configuration(format!("Failed to read settings file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Apply `AXON_*` environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_number("AXON_SYNC_TIMEOUT_MS") {
            self.bus.sync_timeout_ms = v;
        }
        if let Some(v) = env_number("AXON_MAX_CONCURRENT_DELIVERIES") {
            self.bus.max_concurrent_deliveries = v as usize;
        }
        if let Some(v) = env_number("AXON_REPLAY_CAPACITY") {
            self.bus.replay_capacity = v as usize;
        }
        if let Some(v) = env_number("AXON_TASK_TIMEOUT_MS") {
            self.orchestration.task_timeout_ms = v;
        }
        if let Some(v) = env_number("AXON_DRAIN_TIMEOUT_MS") {
            self.orchestration.drain_timeout_ms = v;
        }
        self
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.bus.sync_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestration.task_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestration.drain_timeout_ms)
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("[Settings] Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}
