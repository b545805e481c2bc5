//! Event Bus - typed publish/subscribe with per-subscription ordering.
//!
//! Features:
//!   - Topic enforcement: a publish is validated against the topic registry
//!     before any delivery attempt, so invalid signals never reach anyone
//!   - Exact (`review.request`) and wildcard (`*`, `review.*`) patterns
//!   - Synchronous dispatch: the publisher waits for each destination, up to
//!     `bus.sync_timeout_ms`
//!   - Asynchronous dispatch: each subscription owns a FIFO queue drained by
//!     its own worker, so one publisher's signals arrive in publish order;
//!     a bus-wide semaphore bounds how many deliveries run at once
//!   - Replay of recently published signals

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::Signal;
use crate::config::BusSettings;
use crate::error::AxonError;
use crate::topics::TopicRegistry;

// ─── Dispatch targets ──────────────────────────────────────────────────────

/// Destination that accepts signals.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, signal: Signal) -> Result<(), AxonError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> SignalHandler for FnHandler<F>
where
    F: Fn(Signal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AxonError>> + Send + 'static,
{
    async fn handle(&self, signal: Signal) -> Result<(), AxonError> {
        (self.f)(signal).await
    }
}

/// Wrap an async closure as a [`SignalHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn SignalHandler>
where
    F: Fn(Signal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AxonError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Where a subscription delivers.
#[derive(Clone)]
pub enum DispatchTarget {
    Handler(Arc<dyn SignalHandler>),
    Channel(mpsc::UnboundedSender<Signal>),
}

impl DispatchTarget {
    async fn deliver(&self, signal: Signal) -> Result<(), AxonError> {
        match self {
            DispatchTarget::Handler(handler) => handler.handle(signal).await,
            DispatchTarget::Channel(tx) => tx
                .send(signal)
                .map_err(|_| AxonError::NotFound("subscriber channel closed".to_string())),
        }
    }
}

impl std::fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchTarget::Handler(_) => write!(f, "Handler"),
            DispatchTarget::Channel(_) => write!(f, "Channel"),
        }
    }
}

/// Delivery mode of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Publisher waits for the destination (or the sync timeout).
    Sync,
    /// Publisher only enqueues; a per-subscription worker delivers.
    #[default]
    Async,
}

// ─── Patterns ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum SignalPattern {
    All,
    Exact(String),
    Glob(glob::Pattern),
}

impl SignalPattern {
    fn parse(pattern: &str) -> Result<Self, AxonError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(AxonError::Validation("subscription pattern must not be empty".to_string()));
        }
        if pattern == "*" || pattern == "**" {
            return Ok(SignalPattern::All);
        }
        if pattern.contains(['*', '?', '[']) {
            return glob::Pattern::new(pattern)
                .map(SignalPattern::Glob)
                .map_err(|e| AxonError::Validation(format!("invalid pattern '{}': {}", pattern, e)));
        }
        Ok(SignalPattern::Exact(pattern.to_string()))
    }

    fn matches(&self, wire_type: &str) -> bool {
        match self {
            SignalPattern::All => true,
            SignalPattern::Exact(t) => t == wire_type,
            SignalPattern::Glob(p) => p.matches(wire_type),
        }
    }
}

// ─── Reports ───────────────────────────────────────────────────────────────

/// One subscription that could not take a signal.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub subscription_id: String,
    pub error: AxonError,
}

/// Outcome of a publish call.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub signal_id: String,
    pub wire_type: String,
    pub topic: String,
    /// Synchronous subscriptions that acknowledged the signal
    pub delivered: Vec<String>,
    /// Asynchronous subscriptions the signal was queued for
    pub queued: Vec<String>,
    pub failed: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.queued.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Public view of a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub pattern: String,
    pub mode: DispatchMode,
}

// ─── Bus ───────────────────────────────────────────────────────────────────

struct SubscriptionEntry {
    seq: u64,
    pattern: SignalPattern,
    pattern_src: String,
    mode: DispatchMode,
    target: DispatchTarget,
    /// Feeds the worker of an async subscription.
    queue: Option<mpsc::UnboundedSender<Signal>>,
}

struct EventBusShared {
    topics: Arc<TopicRegistry>,
    subscriptions: RwLock<HashMap<String, SubscriptionEntry>>,
    next_seq: AtomicU64,
    log: Mutex<VecDeque<Signal>>,
    permits: Arc<Semaphore>,
    settings: BusSettings,
}

/// Thread-safe, cloneable handle to one bus instance.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusShared>,
}

impl EventBus {
    pub fn new(topics: Arc<TopicRegistry>, settings: BusSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_deliveries.max(1)));
        Self {
            inner: Arc::new(EventBusShared {
                topics,
                subscriptions: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                log: Mutex::new(VecDeque::new()),
                permits,
                settings,
            }),
        }
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.inner.topics
    }

    // ─── Subscriptions ─────────────────────────────────────────────────

    /// Subscribe a target to every signal whose wire type matches `pattern`.
    ///
    /// An exact pattern must name a registered wire type.
    pub async fn subscribe(
        &self,
        pattern: &str,
        target: DispatchTarget,
        mode: DispatchMode,
    ) -> Result<String, AxonError> {
        let parsed = self.parse_pattern(pattern)?;
        let id = format!("sub-{}", uuid::Uuid::new_v4());

        let queue = match mode {
            DispatchMode::Sync => None,
            DispatchMode::Async => Some(self.spawn_worker(&id, target.clone())),
        };

        let entry = SubscriptionEntry {
            seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
            pattern: parsed,
            pattern_src: pattern.trim().to_string(),
            mode,
            target,
            queue,
        };

        self.inner
            .subscriptions
            .write()
            .await
            .insert(id.clone(), entry);

        tracing::debug!("[EventBus] Subscribed {} to '{}' ({:?})", id, pattern, mode);
        Ok(id)
    }

    /// Subscribe and receive matching signals as a stream.
    pub async fn subscribe_stream(
        &self,
        pattern: &str,
    ) -> Result<(String, UnboundedReceiverStream<Signal>), AxonError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe(pattern, DispatchTarget::Channel(tx), DispatchMode::Sync)
            .await?;
        Ok((id, UnboundedReceiverStream::new(rx)))
    }

    /// Remove a subscription. Signals already queued for it are still
    /// delivered by its worker before it exits.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), AxonError> {
        let removed = self
            .inner
            .subscriptions
            .write()
            .await
            .remove(subscription_id);
        match removed {
            Some(_) => {
                tracing::debug!("[EventBus] Unsubscribed {}", subscription_id);
                Ok(())
            }
            None => Err(AxonError::NotFound(format!("subscription '{}'", subscription_id))),
        }
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let subs = self.inner.subscriptions.read().await;
        let mut entries: Vec<(&String, &SubscriptionEntry)> = subs.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries
            .into_iter()
            .map(|(id, e)| SubscriptionInfo {
                id: id.clone(),
                pattern: e.pattern_src.clone(),
                mode: e.mode,
            })
            .collect()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().await.len()
    }

    // ─── Publish ───────────────────────────────────────────────────────

    /// Validate and deliver a signal.
    ///
    /// Unknown wire types and schema violations fail the call before any
    /// delivery. Individual delivery failures are reported, not raised.
    pub async fn publish(&self, signal: Signal) -> Result<DeliveryReport, AxonError> {
        let (topic, data) = self
            .inner
            .topics
            .validate_wire(signal.wire_type(), signal.data())?;
        let signal = signal.with_normalized_data(data);

        self.record(&signal);

        let targets: Vec<(String, DispatchMode, DispatchTarget, Option<mpsc::UnboundedSender<Signal>>)> = {
            let subs = self.inner.subscriptions.read().await;
            let mut matching: Vec<(&String, &SubscriptionEntry)> = subs
                .iter()
                .filter(|(_, e)| e.pattern.matches(signal.wire_type()))
                .collect();
            matching.sort_by_key(|(_, e)| e.seq);
            matching
                .into_iter()
                .map(|(id, e)| (id.clone(), e.mode, e.target.clone(), e.queue.clone()))
                .collect()
        };

        let mut report = DeliveryReport {
            signal_id: signal.id().to_string(),
            wire_type: signal.wire_type().to_string(),
            topic: topic.name.clone(),
            delivered: Vec::new(),
            queued: Vec::new(),
            failed: Vec::new(),
        };

        let timeout = std::time::Duration::from_millis(self.inner.settings.sync_timeout_ms);

        for (sub_id, mode, target, queue) in targets {
            match mode {
                DispatchMode::Async => {
                    let sent = queue
                        .map(|q| q.send(signal.clone()).is_ok())
                        .unwrap_or(false);
                    if sent {
                        report.queued.push(sub_id);
                    } else {
                        report.failed.push(DeliveryFailure {
                            subscription_id: sub_id,
                            error: AxonError::NotFound("subscription worker stopped".to_string()),
                        });
                    }
                }
                DispatchMode::Sync => {
                    match tokio::time::timeout(timeout, target.deliver(signal.clone())).await {
                        Ok(Ok(())) => report.delivered.push(sub_id),
                        Ok(Err(e)) => {
                            tracing::warn!(
                                "[EventBus] Sync delivery of {} to {} failed: {}",
                                signal.id(),
                                sub_id,
                                e
                            );
                            report.failed.push(DeliveryFailure {
                                subscription_id: sub_id,
                                error: e,
                            });
                        }
                        Err(_) => {
                            tracing::warn!(
                                "[EventBus] Sync delivery of {} to {} timed out after {:?}",
                                signal.id(),
                                sub_id,
                                timeout
                            );
                            report.failed.push(DeliveryFailure {
                                subscription_id: sub_id,
                                error: AxonError::Timeout(format!(
                                    "sync delivery exceeded {} ms",
                                    timeout.as_millis()
                                )),
                            });
                        }
                    }
                }
            }
        }

        tracing::debug!(
            "[EventBus] Published {} ({}) → {} delivered, {} queued, {} failed",
            report.signal_id,
            report.wire_type,
            report.delivered.len(),
            report.queued.len(),
            report.failed.len()
        );
        Ok(report)
    }

    // ─── Replay ────────────────────────────────────────────────────────

    /// Signals matching `pattern` published at or after `since`, oldest first.
    pub fn replay(&self, pattern: &str, since: DateTime<Utc>) -> Result<Vec<Signal>, AxonError> {
        let parsed = self.parse_pattern(pattern)?;
        let log = self.inner.log.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(log
            .iter()
            .filter(|s| s.time() >= since && parsed.matches(s.wire_type()))
            .cloned()
            .collect())
    }

    // ─── Internals ─────────────────────────────────────────────────────

    fn parse_pattern(&self, pattern: &str) -> Result<SignalPattern, AxonError> {
        let parsed = SignalPattern::parse(pattern)?;
        if let SignalPattern::Exact(wire_type) = &parsed {
            self.inner.topics.resolve_wire_type(wire_type)?;
        }
        Ok(parsed)
    }

    fn record(&self, signal: &Signal) {
        let capacity = self.inner.settings.replay_capacity;
        if capacity == 0 {
            return;
        }
        let mut log = self.inner.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.push_back(signal.clone());
        while log.len() > capacity {
            log.pop_front();
        }
    }

    fn spawn_worker(&self, sub_id: &str, target: DispatchTarget) -> mpsc::UnboundedSender<Signal> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        let permits = self.inner.permits.clone();
        let sub_id = sub_id.to_string();

        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let _permit = match permits.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                if let Err(e) = target.deliver(signal.clone()).await {
                    tracing::warn!(
                        "[EventBus] Async delivery of {} to {} failed: {}",
                        signal.id(),
                        sub_id,
                        e
                    );
                }
            }
            tracing::debug!("[EventBus] Worker for {} stopped", sub_id);
        });

        tx
    }
}
