//! Layered credential resolution with caching, throttling and single-flight
//! refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::time::{self, Instant};

use crate::auth::service::AuthService;
use crate::auth::store::TokenStore;
use crate::auth::types::{AuthError, AuthResult, CachedCredential, Credential};
use crate::auth::CredentialCache;
use crate::clock::epoch_millis;
use crate::config::TokenConfig;
use crate::locks::LockManager;
use crate::observability::metrics;

/// Lock name serializing refreshes across callers.
pub const REFRESH_LOCK: &str = "token-refresh";

pub struct TokenProvider {
    config: TokenConfig,
    service: Arc<dyn AuthService>,
    store: Arc<dyn TokenStore>,
    locks: Arc<LockManager>,
    cache: ArcSwapOption<CachedCredential>,
    /// When the last store read or refresh started.
    last_fetch: Mutex<Option<Instant>>,
    authenticated: AtomicBool,
}

impl TokenProvider {
    pub fn new(
        config: TokenConfig,
        service: Arc<dyn AuthService>,
        store: Arc<dyn TokenStore>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            config,
            service,
            store,
            locks,
            cache: ArcSwapOption::empty(),
            last_fetch: Mutex::new(None),
            authenticated: AtomicBool::new(false),
        }
    }

    /// Resolve a usable credential.
    pub async fn resolve(&self) -> AuthResult<Credential> {
        if let Some(credential) = self.cached() {
            metrics::record_token_resolution("cache");
            return Ok(credential);
        }

        self.throttle().await;
        if let Some(credential) = self.cached() {
            metrics::record_token_resolution("cache");
            return Ok(credential);
        }

        self.stamp_fetch();
        let stored = match self.store.get().await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "Token store read failed");
                None
            }
        };

        let refresh_buffer = Duration::from_secs(self.config.refresh_buffer_secs);
        if let Some(credential) = &stored {
            if credential.remaining(epoch_millis()) > refresh_buffer {
                self.cache_credential(credential, self.standard_bound(credential));
                metrics::record_token_resolution("store");
                return Ok(credential.clone());
            }
        }

        let mut last_error = None;
        match stored.as_ref().and_then(|c| c.refresh_token.clone()) {
            Some(refresh_token) => match self.refresh(&refresh_token).await {
                Ok(credential) => return Ok(credential),
                Err(AuthError::Fatal(fault)) => {
                    self.clear_cache();
                    metrics::record_token_resolution("fatal");
                    tracing::warn!(fault = %fault, "Token refresh rejected, session is no longer valid");
                    return Err(AuthError::Fatal(fault));
                }
                Err(AuthError::Unavailable { last_error: fault }) => last_error = fault,
                Err(other) => {
                    tracing::warn!(error = %other, "Token refresh did not complete");
                    last_error = Some(other.fault());
                }
            },
            None => tracing::debug!("No refresh token available"),
        }

        if self.is_authenticated() {
            if let Ok(Some(credential)) = self.store.get().await {
                let now_ms = epoch_millis();
                if !credential.is_expired(now_ms) {
                    let bound = credential
                        .remaining(now_ms)
                        .min(Duration::from_secs(self.config.fallback_cache_secs));
                    self.cache_credential(&credential, bound);
                    metrics::record_token_resolution("fallback");
                    tracing::info!(
                        remaining_ms = credential.remaining(now_ms).as_millis() as u64,
                        "Using near-expiry credential for authenticated session"
                    );
                    return Ok(credential);
                }
            }
        }

        self.clear_cache();
        metrics::record_token_resolution("unavailable");
        Err(AuthError::Unavailable { last_error })
    }

    /// Refresh through the auth service, one caller at a time. A caller that
    /// waited on the lock reuses the credential its predecessor cached.
    async fn refresh(&self, refresh_token: &str) -> AuthResult<Credential> {
        self.locks
            .with_lock(REFRESH_LOCK, None, || async {
                if let Some(credential) = self.cached() {
                    return Ok(credential);
                }

                match self.service.refresh(refresh_token).await {
                    Ok(credential) => {
                        self.cache_credential(&credential, self.standard_bound(&credential));
                        if let Err(e) = self.store.set(&credential).await {
                            tracing::warn!(error = %e, "Failed to persist refreshed credential");
                        }
                        metrics::record_token_resolution("refresh");
                        tracing::debug!(expires_at = credential.expires_at, "Credential refreshed");
                        Ok(credential)
                    }
                    Err(e) => {
                        let fault = e.fault();
                        if fault.is_fatal() {
                            Err(AuthError::Fatal(fault))
                        } else {
                            tracing::warn!(fault = %fault, "Token refresh failed");
                            Err(AuthError::Unavailable {
                                last_error: Some(fault),
                            })
                        }
                    }
                }
            })
            .await?
    }

    /// Wait out the minimum spacing since the last fetch, then stamp a new
    /// one. Waiters that wake together do not push each other back.
    async fn throttle(&self) {
        let interval = Duration::from_millis(self.config.min_fetch_interval_ms);
        let last = *self.last_fetch.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ready_at) = last.map(|at| at + interval) {
            let wait = ready_at.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                tracing::debug!(wait_ms = wait.as_millis() as u64, "Throttling credential fetch");
                time::sleep_until(ready_at).await;
            }
        }
    }

    fn stamp_fetch(&self) {
        let now = Instant::now();
        let mut last = self.last_fetch.lock().unwrap_or_else(PoisonError::into_inner);
        if last.map_or(true, |at| at < now) {
            *last = Some(now);
        }
    }

    /// Cache bound for a normally obtained credential: its lifetime minus the
    /// use buffer, capped by the local max cache duration.
    fn standard_bound(&self, credential: &Credential) -> Duration {
        credential
            .remaining(epoch_millis())
            .saturating_sub(Duration::from_secs(self.config.buffer_before_use_secs))
            .min(Duration::from_secs(self.config.max_cache_secs))
    }

    fn cache_credential(&self, credential: &Credential, bound: Duration) {
        let now = Instant::now();
        self.cache.store(Some(Arc::new(CachedCredential {
            credential: credential.clone(),
            fetched_at: now,
            valid_until: now + bound,
        })));
    }

    fn cached(&self) -> Option<Credential> {
        self.cache
            .load()
            .as_ref()
            .filter(|cached| cached.is_fresh(Instant::now()))
            .map(|cached| cached.credential.clone())
    }

    /// The cached credential if it is still fresh.
    pub fn current(&self) -> Option<Credential> {
        self.cached()
    }

    pub fn clear_cache(&self) {
        self.cache.store(None);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Record an interactive sign-in: persist the credential and mark the
    /// session authenticated.
    pub async fn mark_authenticated(&self, credential: Credential) -> AuthResult<()> {
        self.store.set(&credential).await?;
        self.cache_credential(&credential, self.standard_bound(&credential));
        self.authenticated.store(true, Ordering::SeqCst);
        tracing::info!("Session marked authenticated");
        Ok(())
    }

    /// Forget the session everywhere.
    pub async fn logout(&self) -> AuthResult<()> {
        self.clear_cache();
        self.authenticated.store(false, Ordering::SeqCst);
        self.store.clear().await?;
        tracing::info!("Session logged out");
        Ok(())
    }
}

impl CredentialCache for TokenProvider {
    fn clear_cached(&self) {
        tracing::warn!("Clearing cached credential after fatal auth fault");
        self.clear_cache();
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("cached", &self.cache.load().is_some())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenStore;
    use crate::auth::types::AuthServiceError;
    use crate::config::LockConfig;
    use crate::resilience::classify::ErrorKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedService {
        calls: AtomicUsize,
        replies: Mutex<VecDeque<Result<Credential, AuthServiceError>>>,
    }

    impl ScriptedService {
        fn new(replies: Vec<Result<Credential, AuthServiceError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                replies: Mutex::new(replies.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthService for ScriptedService {
        async fn refresh(&self, _refresh_token: &str) -> Result<Credential, AuthServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AuthServiceError::new("NetworkError", "no scripted reply")))
        }
    }

    fn credential(lifetime: Duration) -> Credential {
        Credential {
            access_token: "access".into(),
            id_token: "id".into(),
            refresh_token: Some("refresh".into()),
            expires_at: epoch_millis() + lifetime.as_millis() as u64,
        }
    }

    fn provider(service: Arc<ScriptedService>, store: Arc<MemoryTokenStore>) -> Arc<TokenProvider> {
        Arc::new(TokenProvider::new(
            TokenConfig::default(),
            service,
            store,
            Arc::new(LockManager::new(LockConfig::default())),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_hit_skips_service() {
        let service = ScriptedService::new(vec![]);
        let store = Arc::new(MemoryTokenStore::with_credential(credential(Duration::from_secs(3600))));
        let tokens = provider(Arc::clone(&service), store);

        tokens.resolve().await.unwrap();
        tokens.resolve().await.unwrap();
        assert_eq!(service.calls(), 0);
        assert!(tokens.current().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_refresh_once() {
        let fresh = credential(Duration::from_secs(3600));
        let service = ScriptedService::new(vec![Ok(fresh.clone())]);
        let store = Arc::new(MemoryTokenStore::with_credential(credential(Duration::from_secs(60))));
        let tokens = provider(Arc::clone(&service), Arc::clone(&store));

        let a = tokio::spawn({
            let tokens = Arc::clone(&tokens);
            async move { tokens.resolve().await }
        });
        let b = tokio::spawn({
            let tokens = Arc::clone(&tokens);
            async move { tokens.resolve().await }
        });

        assert_eq!(a.await.unwrap().unwrap(), fresh);
        assert_eq!(b.await.unwrap().unwrap(), fresh);
        assert_eq!(service.calls(), 1);
        assert_eq!(store.get().await.unwrap(), Some(fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_are_spaced() {
        let service = ScriptedService::new(vec![]);
        let store = Arc::new(MemoryTokenStore::new());
        let tokens = provider(service, store);

        let started = Instant::now();
        assert!(tokens.resolve().await.is_err());
        assert!(tokens.resolve().await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(2_000));
    }

    /// Store whose reads take a little while.
    struct SlowStore(MemoryTokenStore);

    #[async_trait]
    impl TokenStore for SlowStore {
        async fn get(&self) -> crate::storage::StorageResult<Option<Credential>> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.0.get().await
        }

        async fn set(&self, credential: &Credential) -> crate::storage::StorageResult<()> {
            self.0.set(credential).await
        }

        async fn clear(&self) -> crate::storage::StorageResult<()> {
            self.0.clear().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_are_not_serialized_by_throttle() {
        let service = ScriptedService::new(vec![]);
        let store = Arc::new(SlowStore(MemoryTokenStore::with_credential(credential(
            Duration::from_secs(3600),
        ))));
        let tokens = Arc::new(TokenProvider::new(
            TokenConfig::default(),
            service.clone(),
            store,
            Arc::new(LockManager::new(LockConfig::default())),
        ));

        let started = Instant::now();
        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let tokens = Arc::clone(&tokens);
                tokio::spawn(async move {
                    tokens.resolve().await.unwrap();
                    started.elapsed()
                })
            })
            .collect();

        let interval = Duration::from_millis(TokenConfig::default().min_fetch_interval_ms);
        for task in tasks {
            let elapsed = task.await.unwrap();
            assert!(elapsed <= interval + Duration::from_millis(10), "resolved after {elapsed:?}");
        }
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_after_a_fetch_wake_together() {
        let service = ScriptedService::new(vec![]);
        let store = Arc::new(MemoryTokenStore::new());
        let tokens = provider(service, Arc::clone(&store));
        assert!(tokens.resolve().await.is_err());

        let started = Instant::now();
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let tokens = Arc::clone(&tokens);
                tokio::spawn(async move {
                    let _ = tokens.resolve().await;
                    started.elapsed()
                })
            })
            .collect();
        time::sleep(Duration::from_millis(500)).await;
        tokens
            .mark_authenticated(credential(Duration::from_secs(3600)))
            .await
            .unwrap();

        for task in tasks {
            assert!(task.await.unwrap() <= Duration::from_millis(2_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_refresh_clears_and_propagates() {
        let service = ScriptedService::new(vec![Err(AuthServiceError::new(
            "NotAuthorizedException",
            "Refresh Token has been revoked",
        ))]);
        let store = Arc::new(MemoryTokenStore::with_credential(credential(Duration::from_secs(60))));
        let tokens = provider(Arc::clone(&service), store);

        match tokens.resolve().await {
            Err(AuthError::Fatal(fault)) => assert_eq!(fault.kind, ErrorKind::TokenRevoked),
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert!(tokens.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticated_fallback_accepts_near_expiry() {
        let service = ScriptedService::new(vec![Err(AuthServiceError::new("NetworkError", "connection reset"))]);
        let near_expiry = credential(Duration::from_secs(120));
        let store = Arc::new(MemoryTokenStore::new());
        let tokens = provider(Arc::clone(&service), Arc::clone(&store));
        tokens.mark_authenticated(near_expiry.clone()).await.unwrap();
        tokens.clear_cache();

        assert_eq!(tokens.resolve().await.unwrap(), near_expiry);
        assert_eq!(service.calls(), 1);

        // Short fallback cache.
        time::advance(Duration::from_secs(11)).await;
        assert!(tokens.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_transient_failure_is_unavailable() {
        let service = ScriptedService::new(vec![Err(AuthServiceError::new("NetworkError", "connection reset"))]);
        let store = Arc::new(MemoryTokenStore::with_credential(credential(Duration::from_secs(120))));
        let tokens = provider(service, store);

        match tokens.resolve().await {
            Err(err @ AuthError::Unavailable { .. }) => assert_eq!(err.fault().kind, ErrorKind::Network),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_everything() {
        let service = ScriptedService::new(vec![]);
        let store = Arc::new(MemoryTokenStore::new());
        let tokens = provider(service, Arc::clone(&store));
        tokens
            .mark_authenticated(credential(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(tokens.is_authenticated());

        tokens.logout().await.unwrap();
        assert!(!tokens.is_authenticated());
        assert!(tokens.current().is_none());
        assert_eq!(store.get().await.unwrap(), None);
    }
}
