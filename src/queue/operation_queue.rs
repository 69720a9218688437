//! Durable, prioritized queue of deferred mutating operations.

use std::collections::HashSet;
use std::future::{pending, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::clock::epoch_millis;
use crate::config::QueueConfig;
use crate::observability::metrics;
use crate::queue::connectivity::ConnectivitySignal;
use crate::queue::executors::{ExecutorRegistry, ExecutorResult};
use crate::queue::types::{
    DrainReport, DropReason, DroppedOperation, EnqueueOptions, ExecutionOutcome, Priority,
    QueueError, QueueResult, QueueStats, QueuedOperation,
};
use crate::storage::KeyValueStorage;

const DROPPED_CHANNEL_CAPACITY: usize = 64;

pub struct OperationQueue {
    config: QueueConfig,
    storage: Arc<dyn KeyValueStorage>,
    connectivity: ConnectivitySignal,
    executors: ExecutorRegistry,
    /// Kept sorted: priority tier, then arrival.
    items: Mutex<Vec<QueuedOperation>>,
    /// Held for the duration of a drain pass.
    drain_pass: tokio::sync::Mutex<()>,
    /// Serializes snapshot-and-write so an older snapshot never lands last.
    persist_lock: tokio::sync::Mutex<()>,
    /// Whether the persisted list has been folded into `items`.
    restored: AtomicBool,
    wake: Notify,
    stats_tx: watch::Sender<QueueStats>,
    dropped_tx: broadcast::Sender<DroppedOperation>,
}

impl OperationQueue {
    pub fn new(
        config: QueueConfig,
        storage: Arc<dyn KeyValueStorage>,
        connectivity: ConnectivitySignal,
    ) -> Self {
        let (stats_tx, _) = watch::channel(QueueStats::default());
        let (dropped_tx, _) = broadcast::channel(DROPPED_CHANNEL_CAPACITY);
        Self {
            config,
            storage,
            connectivity,
            executors: ExecutorRegistry::new(),
            items: Mutex::new(Vec::new()),
            drain_pass: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            restored: AtomicBool::new(false),
            wake: Notify::new(),
            stats_tx,
            dropped_tx,
        }
    }

    fn items(&self) -> MutexGuard<'_, Vec<QueuedOperation>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn connectivity(&self) -> &ConnectivitySignal {
        &self.connectivity
    }

    /// Restore persisted operations, merging them with anything already
    /// queued in memory. Returns how many operations storage held.
    pub async fn load(&self) -> QueueResult<usize> {
        let (count, changed) = self.merge_persisted().await?;
        if changed {
            self.persist().await;
        }
        self.publish_stats();
        tracing::info!(count, "Offline queue restored");
        Ok(count)
    }

    /// Fold the persisted list into memory. An id present in both keeps the
    /// in-memory copy. Returns the stored count and whether storage is now
    /// behind memory.
    async fn merge_persisted(&self) -> QueueResult<(usize, bool)> {
        let bytes = self.storage.read(&self.config.storage_key).await?;
        let stored: Vec<QueuedOperation> = match bytes {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| QueueError::Storage(e.into()))?,
            None => Vec::new(),
        };
        self.restored.store(true, Ordering::SeqCst);

        let count = stored.len();
        let mut items = self.items();
        let stored_ids: HashSet<&str> = stored.iter().map(|op| op.id.as_str()).collect();
        let changed = items.iter().any(|op| !stored_ids.contains(op.id.as_str()));
        let known: HashSet<String> = items.iter().map(|op| op.id.clone()).collect();
        let missing: Vec<QueuedOperation> = stored
            .iter()
            .filter(|op| !known.contains(&op.id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            items.extend(missing);
            items.sort_by_key(|op| (op.priority, op.enqueued_at));
        }
        Ok((count, changed))
    }

    /// Run `executor` now when online; otherwise, or if it fails, queue the
    /// operation for replay. The executor is registered for `kind` so later
    /// drain passes can find it.
    pub async fn execute_or_enqueue<F, Fut>(
        &self,
        kind: &str,
        payload: Value,
        executor: F,
        options: EnqueueOptions,
    ) -> QueueResult<ExecutionOutcome>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutorResult> + Send + 'static,
    {
        self.executors.register(kind, executor);

        if self.connectivity.is_connected() {
            if let Some(executor) = self.executors.get(kind) {
                match executor(payload.clone()).await {
                    Ok(result) => return Ok(ExecutionOutcome::Executed(result)),
                    Err(e) => {
                        tracing::warn!(kind = %kind, error = %e, "Immediate execution failed, queueing");
                    }
                }
            }
        }

        let id = self.enqueue(kind, payload, options).await?;
        Ok(ExecutionOutcome::Queued { id })
    }

    /// Queue an operation without trying it first.
    pub async fn enqueue(&self, kind: &str, payload: Value, options: EnqueueOptions) -> QueueResult<String> {
        let now = epoch_millis();
        let operation = QueuedOperation {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload,
            priority: options.priority,
            enqueued_at: now,
            expires_at: options
                .expires_in
                .map(|ttl| now + ttl.as_millis() as u64),
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.config.default_max_retries),
            room_id: options.room_id,
        };
        let id = operation.id.clone();

        let evicted = {
            let mut items = self.items();
            let evicted = if items.len() >= self.config.capacity {
                match eviction_candidate(&items, operation.priority) {
                    Some(index) => Some(items.remove(index)),
                    None => {
                        metrics::record_queue_dropped("rejected");
                        return Err(QueueError::Full {
                            capacity: self.config.capacity,
                        });
                    }
                }
            } else {
                None
            };

            let position = items
                .iter()
                .position(|queued| queued.priority > operation.priority)
                .unwrap_or(items.len());
            items.insert(position, operation);
            evicted
        };

        if let Some(evicted) = evicted {
            self.report_dropped(evicted, DropReason::Evicted, None);
        }

        tracing::debug!(kind = %kind, id = %id, "Operation queued");
        self.persist().await;
        self.publish_stats();

        if self.connectivity.is_connected() {
            self.wake.notify_one();
        }
        Ok(id)
    }

    /// One sequential pass over a snapshot of the queue. Returns immediately
    /// if another pass is running.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let Ok(pass) = self.drain_pass.try_lock() else {
            tracing::debug!("Drain already in progress");
            return report;
        };

        self.stats_tx.send_modify(|stats| stats.draining = true);
        let snapshot: Vec<QueuedOperation> = self.items().clone();
        let item_delay = Duration::from_millis(self.config.drain_item_delay_ms);
        tracing::info!(pending = snapshot.len(), "Draining offline queue");

        for operation in snapshot {
            if !self.connectivity.is_connected() {
                report.interrupted = true;
                tracing::info!("Connectivity lost, drain paused");
                break;
            }
            if !self.contains(&operation.id) {
                continue;
            }
            if operation.is_expired(epoch_millis()) {
                if let Some(expired) = self.take(&operation.id) {
                    self.report_dropped(expired, DropReason::Expired, None);
                    report.dropped += 1;
                }
                self.persist().await;
                continue;
            }

            let result = match self.executors.get(&operation.kind) {
                Some(executor) => executor(operation.payload.clone()).await,
                None => Err(format!("no executor registered for kind '{}'", operation.kind)),
            };

            match result {
                Ok(_) => {
                    self.take(&operation.id);
                    report.succeeded += 1;
                    tracing::debug!(kind = %operation.kind, id = %operation.id, "Queued operation replayed");
                }
                Err(error) => {
                    report.failed += 1;
                    if let Some(exhausted) = self.record_retry(&operation.id) {
                        tracing::warn!(
                            kind = %operation.kind,
                            id = %operation.id,
                            retries = exhausted.retry_count,
                            error = %error,
                            "Queued operation dropped after exhausting retries"
                        );
                        self.report_dropped(exhausted, DropReason::RetriesExhausted, Some(error));
                        report.dropped += 1;
                    } else {
                        tracing::debug!(kind = %operation.kind, error = %error, "Queued operation failed, will retry");
                    }
                }
            }

            self.persist().await;
            self.publish_stats();
            time::sleep(item_delay).await;
        }

        drop(pass);
        self.publish_stats();
        report
    }

    /// Delay before the next pass: `base·2^avg_retry`, capped. `None` when
    /// there is nothing to do or the device is offline.
    pub fn reschedule_delay(&self) -> Option<Duration> {
        if !self.connectivity.is_connected() {
            return None;
        }
        let items = self.items();
        if items.is_empty() {
            return None;
        }
        let total: u32 = items.iter().map(|op| op.retry_count).sum();
        let average = (f64::from(total) / items.len() as f64).round() as u32;
        Some(crate::resilience::backoff::exponential_delay(
            average,
            self.config.reschedule_base_ms,
            self.config.reschedule_cap_ms,
        ))
    }

    /// Drain on connectivity restore, on new work, and on the retry schedule,
    /// until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut online = self.connectivity.subscribe();
        let mut next_pass = self
            .connectivity
            .is_connected()
            .then(Instant::now)
            .filter(|_| !self.is_empty());
        tracing::info!("Offline queue worker started");

        loop {
            let scheduled = next_pass;
            let due = async move {
                match scheduled {
                    Some(at) => time::sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Offline queue worker stopping");
                    break;
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    next_pass = (*online.borrow_and_update()).then(Instant::now);
                }
                _ = self.wake.notified() => {
                    next_pass = Some(Instant::now());
                }
                _ = due => {
                    let report = self.drain().await;
                    next_pass = self.reschedule_delay().map(|delay| {
                        tracing::debug!(delay_ms = delay.as_millis() as u64, "Next drain scheduled");
                        Instant::now() + delay
                    });
                    if report != DrainReport::default() {
                        tracing::info!(
                            succeeded = report.succeeded,
                            failed = report.failed,
                            dropped = report.dropped,
                            "Drain pass finished"
                        );
                    }
                }
            }
        }
    }

    /// Ask the worker for a drain pass now.
    pub fn request_drain(&self) {
        self.wake.notify_one();
    }

    fn contains(&self, id: &str) -> bool {
        self.items().iter().any(|op| op.id == id)
    }

    fn take(&self, id: &str) -> Option<QueuedOperation> {
        let mut items = self.items();
        let index = items.iter().position(|op| op.id == id)?;
        Some(items.remove(index))
    }

    /// Bump the retry count; returns the operation if it is now exhausted
    /// (and removed).
    fn record_retry(&self, id: &str) -> Option<QueuedOperation> {
        let mut items = self.items();
        let index = items.iter().position(|op| op.id == id)?;
        items[index].retry_count += 1;
        if items[index].retries_exhausted() {
            Some(items.remove(index))
        } else {
            None
        }
    }

    fn report_dropped(&self, operation: QueuedOperation, reason: DropReason, last_error: Option<String>) {
        metrics::record_queue_dropped(reason.as_str());
        tracing::info!(kind = %operation.kind, id = %operation.id, reason = reason.as_str(), "Operation dropped");
        // No subscribers is fine.
        let _ = self.dropped_tx.send(DroppedOperation {
            operation,
            reason,
            last_error,
        });
    }

    async fn persist(&self) {
        // Never overwrite operations from an earlier run that were not loaded yet.
        if !self.restored.load(Ordering::SeqCst) {
            if let Err(e) = self.merge_persisted().await {
                tracing::warn!(error = %e, "Could not merge persisted queue before writing");
            }
        }
        let _write = self.persist_lock.lock().await;
        let encoded = serde_json::to_vec(&*self.items());
        match encoded {
            Ok(bytes) => {
                if let Err(e) = self.storage.write(&self.config.storage_key, &bytes).await {
                    tracing::error!(error = %e, "Failed to persist offline queue");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode offline queue"),
        }
    }

    fn publish_stats(&self) {
        let stats = {
            let items = self.items();
            let count = |priority: Priority| items.iter().filter(|op| op.priority == priority).count();
            QueueStats {
                total: items.len(),
                high: count(Priority::High),
                medium: count(Priority::Medium),
                low: count(Priority::Low),
                oldest_enqueued_at: items.iter().map(|op| op.enqueued_at).min(),
                draining: self.drain_pass.try_lock().is_err(),
            }
        };
        metrics::record_queue_depth(stats.total);
        self.stats_tx.send_replace(stats);
    }

    /// Remove one operation. Returns whether it was queued.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.take(id).is_some();
        if removed {
            self.persist().await;
            self.publish_stats();
        }
        removed
    }

    /// Drop everything. Returns how many operations were removed.
    pub async fn clear(&self) -> usize {
        let cleared = std::mem::take(&mut *self.items()).len();
        self.restored.store(true, Ordering::SeqCst);
        self.persist().await;
        self.publish_stats();
        tracing::info!(cleared, "Offline queue cleared");
        cleared
    }

    pub fn pending_for_room(&self, room_id: &str) -> Vec<QueuedOperation> {
        self.items()
            .iter()
            .filter(|op| op.room_id.as_deref() == Some(room_id))
            .cloned()
            .collect()
    }

    /// Current contents in drain order.
    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        self.items().clone()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats_tx.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<QueueStats> {
        self.stats_tx.subscribe()
    }

    pub fn subscribe_dropped(&self) -> broadcast::Receiver<DroppedOperation> {
        self.dropped_tx.subscribe()
    }
}

/// Oldest operation in the least important tier that is no more important
/// than `incoming`.
fn eviction_candidate(items: &[QueuedOperation], incoming: Priority) -> Option<usize> {
    let lowest = items
        .iter()
        .map(|op| op.priority)
        .filter(|priority| *priority >= incoming)
        .max()?;
    items.iter().position(|op| op.priority == lowest)
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("len", &self.len())
            .field("connected", &self.connectivity.is_connected())
            .finish()
    }
}
