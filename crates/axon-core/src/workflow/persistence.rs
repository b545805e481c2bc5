//! Execution snapshots.
//!
//! When a workflow runs with persistence configured, the engine records a
//! snapshot before and after every step. Storage is pluggable through
//! [`SnapshotStore`]; two stores ship with the crate:
//!
//! - [`MemorySnapshotStore`] keeps records in memory (inspection, tests)
//! - [`JsonlSnapshotStore`] appends JSON lines under
//!   `<base_dir>/{day}/snapshots-{datetime}.jsonl`, rotating daily

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::executor::StepAudit;
use crate::error::AxonError;

/// What the engine knows about an execution at the moment of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotContext {
    pub workflow: String,
    pub step_id: String,
    /// Value of the configured correlation key in the invocation context
    pub correlation_id: String,
    /// Steps that have produced a result so far
    pub completed: Vec<String>,
    pub context: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    Before,
    After,
}

/// One persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub execution_id: String,
    pub phase: SnapshotPhase,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub context: SnapshotContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_result: Option<StepAudit>,
}

/// Persistence collaborator called around each step.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn snapshot_before(&self, execution_id: &str, context: &SnapshotContext) -> Result<(), AxonError>;

    async fn snapshot_after(
        &self,
        execution_id: &str,
        step_result: &StepAudit,
        context: &SnapshotContext,
    ) -> Result<(), AxonError>;
}

fn record(
    execution_id: &str,
    phase: SnapshotPhase,
    step_result: Option<&StepAudit>,
    context: &SnapshotContext,
) -> SnapshotRecord {
    SnapshotRecord {
        execution_id: execution_id.to_string(),
        phase,
        time: Utc::now(),
        context: context.clone(),
        step_result: step_result.cloned(),
    }
}

// ─── Memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySnapshotStore {
    records: StdMutex<Vec<SnapshotRecord>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SnapshotRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn records_for(&self, execution_id: &str) -> Vec<SnapshotRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.execution_id == execution_id)
            .collect()
    }

    fn push(&self, record: SnapshotRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn snapshot_before(&self, execution_id: &str, context: &SnapshotContext) -> Result<(), AxonError> {
        self.push(record(execution_id, SnapshotPhase::Before, None, context));
        Ok(())
    }

    async fn snapshot_after(
        &self,
        execution_id: &str,
        step_result: &StepAudit,
        context: &SnapshotContext,
    ) -> Result<(), AxonError> {
        self.push(record(execution_id, SnapshotPhase::After, Some(step_result), context));
        Ok(())
    }
}

// ─── JSONL ─────────────────────────────────────────────────────────────────

/// Append-only JSON lines store with daily rotation.
#[derive(Clone)]
pub struct JsonlSnapshotStore {
    base_dir: PathBuf,
    current_file: Arc<Mutex<Option<CurrentFile>>>,
}

struct CurrentFile {
    /// YYYY-MM-DD
    date: String,
    path: PathBuf,
}

impl JsonlSnapshotStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            current_file: Arc::new(Mutex::new(None)),
        }
    }

    /// Store under `~/.axon/snapshots`.
    pub fn in_home() -> Result<Self, AxonError> {
        let home = dirs::home_dir()
            .ok_or_else(|| AxonError::Configuration("cannot determine home directory".to_string()))?;
        Ok(Self::new(home.join(".axon").join("snapshots")))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn append(&self, record: &SnapshotRecord) -> Result<(), AxonError> {
        let today = Local::now().format("%Y-%m-%d").to_string();
        let file_path = self.file_path(&today).await?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .await
            .map_err(|e| AxonError::Internal(format!("open {}: {}", file_path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AxonError::Internal(format!("write {}: {}", file_path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| AxonError::Internal(format!("flush {}: {}", file_path.display(), e)))?;
        Ok(())
    }

    async fn file_path(&self, date: &str) -> Result<PathBuf, AxonError> {
        let mut current = self.current_file.lock().await;

        if let Some(ref cf) = *current {
            if cf.date == date {
                return Ok(cf.path.clone());
            }
        }

        let day_dir = self.base_dir.join(date);
        fs::create_dir_all(&day_dir)
            .await
            .map_err(|e| AxonError::Internal(format!("Failed to create snapshot dir: {}", e)))?;

        let datetime = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let path = day_dir.join(format!("snapshots-{}.jsonl", datetime));

        *current = Some(CurrentFile {
            date: date.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }
}

#[async_trait]
impl SnapshotStore for JsonlSnapshotStore {
    async fn snapshot_before(&self, execution_id: &str, context: &SnapshotContext) -> Result<(), AxonError> {
        self.append(&record(execution_id, SnapshotPhase::Before, None, context))
            .await
    }

    async fn snapshot_after(
        &self,
        execution_id: &str,
        step_result: &StepAudit,
        context: &SnapshotContext,
    ) -> Result<(), AxonError> {
        self.append(&record(execution_id, SnapshotPhase::After, Some(step_result), context))
            .await
    }
}
