//! Keyed table of live subscriptions with mass teardown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::observability::metrics;

type CleanupFn = Box<dyn Fn() + Send + Sync>;

/// A live logical subscription as seen by the registry.
pub struct Subscription {
    id: String,
    topic: String,
    key: String,
    cleanup: CleanupFn,
    active: AtomicBool,
}

impl Subscription {
    /// Create a subscription record. `cleanup` runs at most once.
    pub fn new<F>(id: impl Into<String>, topic: impl Into<String>, scope_id: impl AsRef<str>, cleanup: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let topic = topic.into();
        let key = Self::key_for(&topic, scope_id.as_ref());
        Self {
            id: id.into(),
            topic,
            key,
            cleanup: Box::new(cleanup),
            active: AtomicBool::new(true),
        }
    }

    /// Registry key for a logical stream.
    pub fn key_for(topic: &str, scope_id: &str) -> String {
        format!("{topic}:{scope_id}")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the cleanup once. Later calls are no-ops; a panicking cleanup is
    /// contained and logged. Returns whether this call performed the cleanup.
    pub fn cleanup(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }

        if catch_unwind(AssertUnwindSafe(|| (self.cleanup)())).is_err() {
            tracing::error!(
                subscription_id = %self.id,
                key = %self.key,
                "Subscription cleanup panicked"
            );
        }
        true
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Concurrent subscription table.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: DashMap<String, Arc<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription. An older entry under the same key is cleaned up
    /// so re-subscribing to a stream never leaks the previous one.
    pub fn add(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        let previous = self
            .inner
            .insert(subscription.key.clone(), Arc::clone(&subscription));

        if let Some(previous) = previous {
            if previous.id != subscription.id {
                tracing::debug!(
                    key = %subscription.key,
                    replaced = %previous.id,
                    "Replacing existing subscription"
                );
                previous.cleanup();
            }
        }

        metrics::record_registry_size(self.inner.len());
        subscription
    }

    /// Remove an entry without running its cleanup.
    pub fn remove(&self, key: &str) -> Option<Arc<Subscription>> {
        let removed = self.inner.remove(key).map(|(_, sub)| sub);
        metrics::record_registry_size(self.inner.len());
        removed
    }

    /// Remove an entry only if it is still the subscription with `id`.
    pub fn remove_if_current(&self, key: &str, id: &str) -> bool {
        let removed = self.inner.remove_if(key, |_, sub| sub.id == id).is_some();
        metrics::record_registry_size(self.inner.len());
        removed
    }

    /// Remove an entry and run its cleanup.
    pub fn cancel(&self, key: &str) -> bool {
        match self.remove(key) {
            Some(sub) => {
                sub.cleanup();
                true
            }
            None => false,
        }
    }

    /// Tear down every subscription. Entries are detached before their
    /// cleanups run, so a cleanup may touch the registry freely.
    pub fn mass_cancel(&self) -> usize {
        let keys: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, sub)) = self.inner.remove(&key) {
                sub.cleanup();
                cancelled += 1;
            }
        }

        metrics::record_registry_size(self.inner.len());
        cancelled
    }

    pub fn get(&self, key: &str) -> Option<Arc<Subscription>> {
        self.inner.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
