//! Named locks with bounded FIFO wait queues, TTLs and a background sweeper.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::locks::types::{LockError, LockInfo, LockResult, LockStats, SweepReport};
use crate::observability::metrics;

struct HeldLock {
    request_id: Uuid,
    acquired_at: Instant,
    expires_at: Instant,
    flagged: bool,
}

struct Waiter {
    request_id: Uuid,
    enqueued_at: Instant,
    timeout_at: Instant,
    ttl: Duration,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockTable {
    held: HashMap<String, HeldLock>,
    waiters: HashMap<String, VecDeque<Waiter>>,
}

impl LockTable {
    fn insert(&mut self, name: &str, request_id: Uuid, ttl: Duration, now: Instant) {
        self.held.insert(
            name.to_string(),
            HeldLock {
                request_id,
                acquired_at: now,
                expires_at: now + ttl,
                flagged: false,
            },
        );
    }

    fn owned_by(&self, name: &str, request_id: Uuid) -> bool {
        self.held
            .get(name)
            .is_some_and(|held| held.request_id == request_id)
    }

    fn waiting(&self) -> usize {
        self.waiters.values().map(VecDeque::len).sum()
    }
}

/// Process-wide named mutual exclusion.
pub struct LockManager {
    config: LockConfig,
    table: Mutex<LockTable>,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            table: Mutex::new(LockTable::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(Duration::from_secs(self.config.default_ttl_secs))
    }

    fn check_available(&self, table: &LockTable, name: &str) -> LockResult<()> {
        if table.held.contains_key(name) {
            return Err(LockError::AlreadyLocked {
                name: name.to_string(),
            });
        }
        if table.held.len() >= self.config.max_concurrent_operations {
            return Err(LockError::CapacityExceeded {
                max: self.config.max_concurrent_operations,
            });
        }
        Ok(())
    }

    /// Take `name` without waiting.
    pub fn try_acquire(&self, name: &str, ttl: Option<Duration>) -> LockResult<LockGuard<'_>> {
        let ttl = self.ttl(ttl);
        let request_id = Uuid::new_v4();

        let mut table = self.table();
        if let Err(err) = self.check_available(&table, name) {
            metrics::record_lock_contention("rejected");
            return Err(err);
        }
        table.insert(name, request_id, ttl, Instant::now());
        metrics::record_locks_held(table.held.len());
        drop(table);

        metrics::record_lock_contention("acquired");
        Ok(LockGuard::new(self, name, request_id))
    }

    /// Take `name`, joining its wait queue on contention when queueing is
    /// enabled. Waiters are served in arrival order.
    pub async fn acquire(&self, name: &str, ttl: Option<Duration>) -> LockResult<LockGuard<'_>> {
        let ttl = self.ttl(ttl);
        let request_id = Uuid::new_v4();
        let queue_timeout = Duration::from_secs(self.config.queue_timeout_secs);
        let enqueued_at = Instant::now();

        let granted = {
            let mut table = self.table();
            match self.check_available(&table, name) {
                Ok(()) => {
                    table.insert(name, request_id, ttl, enqueued_at);
                    metrics::record_locks_held(table.held.len());
                    drop(table);
                    metrics::record_lock_contention("acquired");
                    return Ok(LockGuard::new(self, name, request_id));
                }
                Err(err) if !self.config.queue_enabled => {
                    metrics::record_lock_contention("rejected");
                    return Err(err);
                }
                Err(_) => {}
            }

            let queue = table.waiters.entry(name.to_string()).or_default();
            if queue.len() >= self.config.max_queue_size {
                metrics::record_lock_contention("queue_full");
                return Err(LockError::QueueFull {
                    name: name.to_string(),
                });
            }

            let (tx, rx) = oneshot::channel();
            queue.push_back(Waiter {
                request_id,
                enqueued_at,
                timeout_at: enqueued_at + queue_timeout,
                ttl,
                grant: tx,
            });
            rx
        };

        metrics::record_lock_contention("queued");
        tracing::debug!(lock = %name, "Waiting for lock");

        match time::timeout(queue_timeout, granted).await {
            Ok(Ok(())) => Ok(LockGuard::new(self, name, request_id)),
            // Sender dropped: the dispatcher found this waiter past its deadline.
            Ok(Err(_)) => {
                metrics::record_lock_contention("timeout");
                Err(LockError::QueueTimeout {
                    name: name.to_string(),
                    waited: enqueued_at.elapsed(),
                })
            }
            Err(_) => {
                let mut table = self.table();
                if let Some(queue) = table.waiters.get_mut(name) {
                    queue.retain(|waiter| waiter.request_id != request_id);
                    if queue.is_empty() {
                        table.waiters.remove(name);
                    }
                }

                // Granted after the timer fired but before the receiver went away.
                if table.owned_by(name, request_id) {
                    drop(table);
                    return Ok(LockGuard::new(self, name, request_id));
                }
                drop(table);

                metrics::record_lock_contention("timeout");
                tracing::warn!(lock = %name, waited = ?queue_timeout, "Timed out waiting for lock");
                Err(LockError::QueueTimeout {
                    name: name.to_string(),
                    waited: queue_timeout,
                })
            }
        }
    }

    /// Run `f` while holding `name`. The lock is released when `f` finishes,
    /// or when the returned future is dropped.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, ttl: Option<Duration>, f: F) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(name, ttl).await?;
        let output = f().await;
        guard.release();
        Ok(output)
    }

    fn release_owned(&self, name: &str, request_id: Uuid) -> bool {
        let mut table = self.table();
        if !table.owned_by(name, request_id) {
            tracing::debug!(lock = %name, "Stale release ignored");
            return false;
        }
        table.held.remove(name);
        self.dispatch(&mut table, Some(name));
        metrics::record_locks_held(table.held.len());
        true
    }

    /// Release `name` regardless of owner and resume its next waiter.
    pub fn force_release(&self, name: &str) -> bool {
        let mut table = self.table();
        let released = table.held.remove(name).is_some();
        if released {
            tracing::warn!(lock = %name, "Lock force-released");
        }
        self.dispatch(&mut table, Some(name));
        metrics::record_locks_held(table.held.len());
        released
    }

    /// Release every lock and resume waiters. Returns the number released.
    pub fn clear_all(&self) -> usize {
        let mut table = self.table();
        let released = table.held.len();
        table.held.clear();
        self.dispatch(&mut table, None);
        metrics::record_locks_held(table.held.len());
        tracing::warn!(released, "All locks cleared");
        released
    }

    /// Hand free locks to their queued waiters. `first` is served before the
    /// rest so a released name goes to its own queue before capacity is
    /// offered to names blocked on `max_concurrent_operations`.
    fn dispatch(&self, table: &mut LockTable, first: Option<&str>) {
        let now = Instant::now();
        let mut names: Vec<String> = first.map(str::to_string).into_iter().collect();
        names.extend(
            table
                .waiters
                .keys()
                .filter(|key| Some(key.as_str()) != first)
                .cloned(),
        );

        for name in names {
            loop {
                if table.held.contains_key(&name)
                    || table.held.len() >= self.config.max_concurrent_operations
                {
                    break;
                }
                let Some(waiter) = table.waiters.get_mut(&name).and_then(VecDeque::pop_front) else {
                    break;
                };
                if waiter.grant.is_closed() || now >= waiter.timeout_at {
                    continue;
                }

                table.insert(&name, waiter.request_id, waiter.ttl, now);
                if waiter.grant.send(()).is_ok() {
                    tracing::debug!(
                        lock = %name,
                        waited_ms = now.duration_since(waiter.enqueued_at).as_millis() as u64,
                        "Lock handed to waiter"
                    );
                    break;
                }
                table.held.remove(&name);
            }

            if table.waiters.get(&name).is_some_and(VecDeque::is_empty) {
                table.waiters.remove(&name);
            }
        }
    }

    /// One maintenance pass: expire locks past their TTL, flag suspected
    /// deadlocks, drop abandoned waiters, resume the rest.
    pub fn sweep_once(&self) -> SweepReport {
        let now = Instant::now();
        let deadlock = Duration::from_secs(self.config.deadlock_threshold_secs);
        let mut table = self.table();
        let mut report = SweepReport::default();

        report.expired = table
            .held
            .iter()
            .filter(|(_, held)| now >= held.expires_at)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &report.expired {
            table.held.remove(name);
            tracing::warn!(lock = %name, "Releasing lock held past its TTL");
        }

        for (name, held) in table.held.iter_mut() {
            if !held.flagged && now.duration_since(held.acquired_at) >= deadlock {
                held.flagged = true;
                report.newly_flagged.push(name.clone());
                tracing::warn!(
                    lock = %name,
                    held_for = ?now.duration_since(held.acquired_at),
                    "Possible deadlock: lock held past threshold"
                );
            }
        }

        let before = table.waiting();
        for queue in table.waiters.values_mut() {
            queue.retain(|waiter| !waiter.grant.is_closed() && now < waiter.timeout_at);
        }
        table.waiters.retain(|_, queue| !queue.is_empty());
        report.abandoned_waiters = before - table.waiting();

        self.dispatch(&mut table, None);
        metrics::record_locks_held(table.held.len());
        report
    }

    /// Periodic sweeper. Runs until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        tracing::info!(interval = ?period, "Lock sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_once();
                    if !report.expired.is_empty() || report.abandoned_waiters > 0 {
                        tracing::info!(
                            expired = report.expired.len(),
                            abandoned_waiters = report.abandoned_waiters,
                            "Lock sweep"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Lock sweeper stopping");
                    break;
                }
            }
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.table().held.contains_key(name)
    }

    pub fn queue_len(&self, name: &str) -> usize {
        self.table().waiters.get(name).map_or(0, VecDeque::len)
    }

    pub fn lock_info(&self, name: &str) -> Option<LockInfo> {
        let now = Instant::now();
        self.table().held.get(name).map(|held| LockInfo {
            name: name.to_string(),
            held_for: now.duration_since(held.acquired_at),
            expires_in: held.expires_at.saturating_duration_since(now),
        })
    }

    pub fn stats(&self) -> LockStats {
        let now = Instant::now();
        let deadlock = Duration::from_secs(self.config.deadlock_threshold_secs);
        let table = self.table();
        let mut suspected_deadlocks: Vec<String> = table
            .held
            .iter()
            .filter(|(_, held)| now.duration_since(held.acquired_at) >= deadlock)
            .map(|(name, _)| name.clone())
            .collect();
        suspected_deadlocks.sort();

        LockStats {
            held: table.held.len(),
            waiting: table.waiting(),
            suspected_deadlocks,
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("LockManager")
            .field("held", &stats.held)
            .field("waiting", &stats.waiting)
            .finish()
    }
}

/// Ownership of a named lock. Dropping the guard releases it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    name: String,
    request_id: Uuid,
    active: bool,
}

impl<'a> LockGuard<'a> {
    fn new(manager: &'a LockManager, name: &str, request_id: Uuid) -> Self {
        Self {
            manager,
            name: name.to_string(),
            request_id,
            active: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release now. Returns false if the lock had already been taken away
    /// (expired or force-released).
    pub fn release(mut self) -> bool {
        self.active = false;
        self.manager.release_owned(&self.name, self.request_id)
    }
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.manager.release_owned(&self.name, self.request_id);
        }
    }
}
