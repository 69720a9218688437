//! Kind → executor lookup used when replaying queued operations.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

/// Executor failures are reported as text; the queue only retries or drops.
pub type ExecutorResult = Result<Value, String>;

pub type Executor = Arc<dyn Fn(Value) -> BoxFuture<'static, ExecutorResult> + Send + Sync>;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: DashMap<String, Executor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for `kind`.
    pub fn register<F, Fut>(&self, kind: impl Into<String>, executor: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutorResult> + Send + 'static,
    {
        let executor: Executor = Arc::new(move |payload| executor(payload).boxed());
        self.executors.insert(kind.into(), executor);
    }

    pub fn get(&self, kind: &str) -> Option<Executor> {
        self.executors.get(kind).map(|e| Arc::clone(e.value()))
    }

    pub fn kinds(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.key().clone()).collect()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
