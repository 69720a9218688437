//! Explicit wiring of every component.
//!
//! # Responsibilities
//! - Build the component graph from a validated `ResilienceConfig`
//! - Start background loops (lock sweeper, queue worker)
//! - Stop them and tear down live subscriptions
//!
//! # Design Decisions
//! - No globals: everything hangs off one `AppContext`
//! - Auth service and storage can be injected for tests and embedders

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::auth::{AuthService, HttpAuthService, StorageTokenStore, TokenProvider};
use crate::config::{ResilienceConfig, StorageBackend};
use crate::lifecycle::Shutdown;
use crate::locks::LockManager;
use crate::queue::{ConnectivitySignal, OperationQueue, QueueError};
use crate::resilience::CircuitBreaker;
use crate::storage::{FileStorage, KeyValueStorage, MemoryStorage};
use crate::subscription::{ConnectionManager, StreamError, SubscriptionRegistry};

/// Time allowed for background loops to exit on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("streaming setup failed: {0}")]
    Stream(#[from] StreamError),

    #[error("auth client setup failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("offline queue restore failed: {0}")]
    Queue(#[from] QueueError),
}

pub struct AppContext {
    pub config: ResilienceConfig,
    pub registry: Arc<SubscriptionRegistry>,
    pub locks: Arc<LockManager>,
    pub tokens: Arc<TokenProvider>,
    pub breaker: Arc<CircuitBreaker>,
    pub connections: Arc<ConnectionManager>,
    pub connectivity: ConnectivitySignal,
    pub queue: Arc<OperationQueue>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    /// Build from config with the HTTP auth service and configured storage.
    pub fn new(config: ResilienceConfig) -> Result<Self, ContextError> {
        let auth: Arc<dyn AuthService> = Arc::new(HttpAuthService::new(&config.auth)?);
        let storage: Arc<dyn KeyValueStorage> = match config.storage.backend {
            StorageBackend::File => Arc::new(FileStorage::new(PathBuf::from(&config.storage.directory))),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        };
        Self::with_services(config, auth, storage)
    }

    /// Build with caller-supplied auth service and storage.
    pub fn with_services(
        config: ResilienceConfig,
        auth: Arc<dyn AuthService>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Self, ContextError> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let locks = Arc::new(LockManager::new(config.locks.clone()));
        let tokens = Arc::new(TokenProvider::new(
            config.token.clone(),
            auth,
            Arc::new(StorageTokenStore::new(Arc::clone(&storage))),
            Arc::clone(&locks),
        ));
        let breaker = Arc::new(
            CircuitBreaker::new(config.breaker.clone(), Arc::clone(&registry))
                .with_credential_cache(Arc::clone(&tokens) as _),
        );
        let connections = Arc::new(ConnectionManager::new(
            config.connection.clone(),
            Arc::clone(&breaker),
            Arc::clone(&tokens),
            Arc::clone(&registry),
        )?);
        let connectivity = ConnectivitySignal::new(true);
        let queue = Arc::new(OperationQueue::new(
            config.queue.clone(),
            storage,
            connectivity.clone(),
        ));

        Ok(Self {
            config,
            registry,
            locks,
            tokens,
            breaker,
            connections,
            connectivity,
            queue,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Restore the offline queue and start background loops.
    pub async fn start(&self) -> Result<(), ContextError> {
        let restored = self.queue.load().await?;

        let sweeper = tokio::spawn(Arc::clone(&self.locks).run_sweeper(self.shutdown.subscribe()));
        let worker = tokio::spawn(Arc::clone(&self.queue).run(self.shutdown.subscribe()));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([sweeper, worker]);

        tracing::info!(
            restored_operations = restored,
            endpoint = %self.config.connection.endpoint,
            "Resilience layer started"
        );
        Ok(())
    }

    /// Stop background loops and cancel every live subscription.
    pub async fn stop(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        let cancelled = self.registry.mass_cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            match tokio::time::timeout(STOP_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Background task failed"),
                Err(_) => tracing::warn!("Background task did not stop in time"),
            }
        }
        tracing::info!(cancelled_subscriptions = cancelled, "Resilience layer stopped");
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("breaker", &self.breaker.state())
            .field("subscriptions", &self.registry.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}
