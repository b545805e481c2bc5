//! Agent Registry - idempotent lifecycle management for agent workers.
//!
//! Every specialist and orchestrator runs as its own tokio task with a
//! mailbox. The registry maps agent ids to live handles:
//!   - `get_or_spawn` returns the running handle, or spawns exactly one new
//!     worker even when many callers race for the same id
//!   - dead handles are purged when a lookup notices them, so the next
//!     `get_or_spawn` starts a fresh worker
//!   - the map itself is never handed out

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::AbortHandle;

use crate::error::AxonError;
use crate::events::{Signal, SignalHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Specialist,
    Orchestrator,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Specialist => "specialist",
            AgentKind::Orchestrator => "orchestrator",
        }
    }
}

/// What a worker's mailbox carries.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Signal(Signal),
    /// Finish the messages already queued, then exit.
    Shutdown,
}

#[derive(Debug, Default)]
struct AgentStats {
    delivered: AtomicU64,
    failed_deliveries: AtomicU64,
}

/// Point-in-time delivery counters of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentStatsSnapshot {
    pub delivered: u64,
    pub failed_deliveries: u64,
}

/// Handle to one spawned worker.
///
/// Clones refer to the same instance; two handles are equal when they
/// point at the same spawn.
#[derive(Clone)]
pub struct AgentHandle {
    id: String,
    kind: AgentKind,
    instance_id: String,
    mailbox: mpsc::UnboundedSender<AgentMessage>,
    abort: AbortHandle,
    /// Flips to `true` once the worker future returns
    exited: watch::Receiver<bool>,
    stopped: Arc<AtomicBool>,
    stats: Arc<AgentStats>,
}

impl AgentHandle {
    /// Spawn `worker` on the tokio runtime, feeding it a fresh mailbox.
    pub fn spawn<F, Fut>(id: impl Into<String>, kind: AgentKind, worker: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedReceiver<AgentMessage>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (exited_tx, exited) = watch::channel(false);
        let work = worker(rx);
        let task = tokio::spawn(async move {
            work.await;
            let _ = exited_tx.send(true);
        });
        Self {
            id,
            kind,
            instance_id: uuid::Uuid::new_v4().to_string(),
            mailbox: tx,
            abort: task.abort_handle(),
            exited,
            stopped: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(AgentStats::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Put a message in the worker's mailbox.
    pub fn send(&self, message: AgentMessage) -> Result<(), AxonError> {
        match self.mailbox.send(message) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.stats.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                Err(AxonError::NotFound(format!("agent '{}' is not running", self.id)))
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.mailbox.is_closed()
    }

    /// Ask the worker to exit once it has handled everything queued before
    /// this call.
    pub fn shutdown(&self) {
        let _ = self.mailbox.send(AgentMessage::Shutdown);
    }

    /// `shutdown`, then wait up to `grace` for the worker to exit.
    ///
    /// Returns `false` if the worker was still running when `grace` ran out.
    /// An aborted worker counts as exited.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.shutdown();
        let mut exited = self.exited.clone();
        let drained = tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_ok();
        drained
    }

    /// Terminate the worker. Messages still in its mailbox are dropped.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.abort.abort();
    }

    pub fn stats(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}

impl PartialEq for AgentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
    }
}

impl Eq for AgentHandle {}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("instance_id", &self.instance_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[async_trait]
impl SignalHandler for AgentHandle {
    async fn handle(&self, signal: Signal) -> Result<(), AxonError> {
        self.send(AgentMessage::Signal(signal))
    }
}

/// Thread-safe id → handle registry.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentHandle>>,
    /// Per-id spawn locks so only one caller runs a factory for an id.
    spawn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live handle for `id`, or spawn one with `factory(opts)`.
    ///
    /// Concurrent callers for the same id wait for the in-flight spawn and
    /// receive its handle. A factory error is returned to the caller that
    /// ran it; the next caller tries again.
    pub async fn get_or_spawn<O, F, Fut>(&self, id: &str, opts: O, factory: F) -> Result<AgentHandle, AxonError>
    where
        F: FnOnce(O) -> Fut,
        Fut: Future<Output = Result<AgentHandle, AxonError>>,
    {
        if let Some(handle) = self.live(id).await {
            return Ok(handle);
        }

        let lock = {
            let mut locks = self.spawn_locks.lock().await;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(handle) = self.live(id).await {
            return Ok(handle);
        }

        let handle = factory(opts).await?;
        if handle.id() != id {
            handle.stop();
            return Err(AxonError::Internal(format!(
                "factory for '{}' produced agent '{}'",
                id,
                handle.id()
            )));
        }

        self.agents
            .write()
            .await
            .insert(id.to_string(), handle.clone());
        // waiters still holding the lock find the live handle on recheck
        self.spawn_locks.lock().await.remove(id);
        tracing::info!(
            "[AgentRegistry] Spawned {} {} ({})",
            handle.kind().as_str(),
            id,
            handle.instance_id()
        );
        Ok(handle)
    }

    /// Live handle for `id`.
    pub async fn lookup(&self, id: &str) -> Result<AgentHandle, AxonError> {
        self.live(id)
            .await
            .ok_or_else(|| AxonError::NotFound(format!("agent '{}'", id)))
    }

    /// All live agents, sorted by id.
    pub async fn list(&self) -> Vec<(String, AgentHandle)> {
        let mut agents = self.agents.write().await;
        agents.retain(|id, handle| {
            let alive = handle.is_alive();
            if !alive {
                tracing::debug!("[AgentRegistry] Purged dead agent {}", id);
            }
            alive
        });
        let mut out: Vec<(String, AgentHandle)> = agents
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn len(&self) -> usize {
        self.list().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop and deregister one agent.
    pub async fn stop(&self, id: &str) -> Result<(), AxonError> {
        let removed = self.agents.write().await.remove(id);
        self.spawn_locks.lock().await.remove(id);
        match removed {
            Some(handle) => {
                handle.stop();
                tracing::info!("[AgentRegistry] Stopped {}", id);
                Ok(())
            }
            None => Err(AxonError::NotFound(format!("agent '{}'", id))),
        }
    }

    /// Stop and deregister every agent.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, AgentHandle)> = self.agents.write().await.drain().collect();
        self.spawn_locks.lock().await.clear();
        for (_, handle) in &drained {
            handle.stop();
        }
        if !drained.is_empty() {
            tracing::info!("[AgentRegistry] Stopped {} agent(s)", drained.len());
        }
    }

    async fn live(&self, id: &str) -> Option<AgentHandle> {
        let handle = self.agents.read().await.get(id).cloned()?;
        if handle.is_alive() {
            return Some(handle);
        }

        let mut agents = self.agents.write().await;
        // only purge the instance we saw; a respawn may have replaced it
        if agents.get(id).map(|h| h == &handle).unwrap_or(false) {
            agents.remove(id);
            tracing::debug!("[AgentRegistry] Purged dead agent {}", id);
        }
        None
    }
}
