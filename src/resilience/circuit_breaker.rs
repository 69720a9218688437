//! Circuit breaker guarding streaming connection attempts.
//!
//! # States
//! - Closed: normal operation, attempts pass through
//! - Open: backend assumed unusable, attempts fail fast
//! - Half-Open: one probe attempt tests whether the backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold, or any fatal auth fault
//! Open → Half-Open: first can_proceed() at/after open_until
//! Half-Open → Closed: probe records a success
//! Half-Open → Open: probe records a failure (fresh open_until)
//! ```
//!
//! # Design Decisions
//! - One breaker per application context, shared by all subscriptions
//! - Opening mass-cancels every live subscription in the registry
//! - Fatal auth faults also clear cached credentials
//! - Single probe in Half-Open; the probe slot is released after
//!   `probe_timeout_secs` if the probe never reports back

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::auth::CredentialCache;
use crate::config::BreakerConfig;
use crate::observability::metrics;
use crate::resilience::classify::Fault;
use crate::subscription::SubscriptionRegistry;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of the breaker for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    /// Time left until the breaker allows a probe; zero unless open.
    pub open_remaining: Duration,
    pub threshold: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    open_until: Option<Instant>,
    probe_started: Option<Instant>,
}

/// What `record_failure` decided while holding the lock; side effects run
/// after the lock is released because mass-cancel re-enters subscriptions.
enum Trip {
    None,
    Open { fatal: bool },
    ClearCredentials,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    registry: Arc<SubscriptionRegistry>,
    credentials: Option<Arc<dyn CredentialCache>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                open_until: None,
                probe_started: None,
            }),
            registry,
            credentials: None,
        }
    }

    /// Attach the credential cache cleared on fatal auth faults.
    pub fn with_credential_cache(mut self, credentials: Arc<dyn CredentialCache>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.config.open_timeout_secs)
    }

    /// Whether a new connection attempt may start.
    pub fn can_proceed(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let until = inner.open_until.unwrap_or(now);
                if now < until {
                    return false;
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_started = Some(now);
                drop(inner);

                tracing::info!("Circuit breaker half-open, admitting probe");
                metrics::record_breaker_transition(BreakerState::HalfOpen.as_str());
                true
            }
            BreakerState::HalfOpen => {
                if !self.config.single_probe {
                    return true;
                }
                let probe_timeout = Duration::from_secs(self.config.probe_timeout_secs);
                match inner.probe_started {
                    Some(started) if now.duration_since(started) < probe_timeout => false,
                    _ => {
                        tracing::debug!("Half-open probe slot expired, admitting new probe");
                        inner.probe_started = Some(now);
                        true
                    }
                }
            }
        }
    }

    /// Record a success; closes the breaker unless it is open.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            return;
        }

        let was = inner.state;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.probe_started = None;
        drop(inner);

        if was != BreakerState::Closed {
            tracing::info!("Circuit breaker closed after successful probe");
            metrics::record_breaker_transition(BreakerState::Closed.as_str());
        }
    }

    /// Record a failure; opens on threshold, fatal faults, or a failed probe.
    pub fn record_failure(&self, fault: &Fault) {
        let trip = {
            let mut inner = self.lock();
            inner.failure_count = inner.failure_count.saturating_add(1);

            match inner.state {
                BreakerState::Open if fault.is_fatal() => Trip::ClearCredentials,
                BreakerState::Open => Trip::None,
                BreakerState::HalfOpen => Trip::Open {
                    fatal: fault.is_fatal(),
                },
                BreakerState::Closed => {
                    if fault.is_fatal() || inner.failure_count >= self.config.failure_threshold {
                        Trip::Open {
                            fatal: fault.is_fatal(),
                        }
                    } else {
                        Trip::None
                    }
                }
            }
        };

        tracing::debug!(fault = %fault, "Circuit breaker recorded failure");

        match trip {
            Trip::None => {}
            Trip::ClearCredentials => self.clear_credentials(),
            Trip::Open { fatal } => self.open_with(fault, fatal),
        }
    }

    /// Force the breaker open.
    pub fn open(&self, fault: &Fault) {
        self.open_with(fault, fault.is_fatal());
    }

    fn open_with(&self, fault: &Fault, fatal: bool) {
        let failure_count = {
            let mut inner = self.lock();
            inner.state = BreakerState::Open;
            inner.open_until = Some(Instant::now() + self.open_timeout());
            inner.probe_started = None;
            inner.failure_count
        };

        tracing::warn!(
            fault = %fault,
            failure_count,
            open_secs = self.config.open_timeout_secs,
            "Circuit breaker opened, cancelling live subscriptions"
        );
        metrics::record_breaker_transition(BreakerState::Open.as_str());

        let cancelled = self.registry.mass_cancel();
        tracing::info!(cancelled, "Subscriptions torn down by circuit breaker");

        if fatal {
            self.clear_credentials();
        }
    }

    fn clear_credentials(&self) {
        if let Some(credentials) = &self.credentials {
            tracing::warn!("Fatal authentication fault, clearing cached credentials");
            credentials.clear_cached();
        }
    }

    /// Manual escape hatch: force closed regardless of the open timer.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.open_until = None;
        inner.probe_started = None;
        drop(inner);

        tracing::info!("Circuit breaker manually reset");
        metrics::record_breaker_transition(BreakerState::Closed.as_str());
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        let open_remaining = match (inner.state, inner.open_until) {
            (BreakerState::Open, Some(until)) => until.saturating_duration_since(now),
            _ => Duration::ZERO,
        };
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            open_remaining,
            threshold: self.config.failure_threshold,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classify::ErrorKind;
    use crate::subscription::Subscription;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transient() -> Fault {
        Fault::new(ErrorKind::Network, "socket reset")
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default(), Arc::new(SubscriptionRegistry::new()))
    }

    #[derive(Default)]
    struct CountingCache(AtomicUsize);

    impl CredentialCache for CountingCache {
        fn clear_cached(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let cb = breaker();
        cb.record_failure(&transient());
        cb.record_failure(&transient());
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.can_proceed());

        cb.record_failure(&transient());
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let cb = breaker();
        cb.record_failure(&transient());
        cb.record_failure(&transient());
        cb.record_success();
        cb.record_failure(&transient());
        cb.record_failure(&transient());
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_opens_immediately_and_clears_credentials() {
        let cache = Arc::new(CountingCache::default());
        let cb = breaker().with_credential_cache(cache.clone());

        cb.record_failure(&Fault::classify("NotAuthorizedException", "Token is invalid"));
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cache.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout() {
        let cb = breaker();
        cb.open(&transient());
        assert!(!cb.can_proceed());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.can_proceed());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.can_proceed());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        // Probe in flight: no second probe.
        assert!(!cb.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let cb = breaker();
        cb.open(&transient());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.can_proceed());

        cb.record_success();
        let snap = cb.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert!(cb.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timer() {
        let cb = breaker();
        cb.open(&transient());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.can_proceed());

        cb.record_failure(&transient());
        let snap = cb.snapshot();
        assert_eq!(snap.state, BreakerState::Open);
        assert_eq!(snap.open_remaining, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_slot_expires() {
        let cb = breaker();
        cb.open(&transient());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.can_proceed());
        assert!(!cb.can_proceed());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loose_half_open() {
        let config = BreakerConfig {
            single_probe: false,
            ..BreakerConfig::default()
        };
        let cb = CircuitBreaker::new(config, Arc::new(SubscriptionRegistry::new()));
        cb.open(&transient());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.can_proceed());
        assert!(cb.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_ignored_while_open() {
        let cb = breaker();
        cb.open(&transient());
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker();
        cb.open(&transient());
        cb.reset();
        let snap = cb.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.open_remaining, Duration::ZERO);
        assert!(cb.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_mass_cancels_registry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let cb = CircuitBreaker::new(BreakerConfig::default(), registry.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let hits = hits.clone();
            registry.add(Subscription::new(
                format!("sub-{i}"),
                "onVote",
                format!("room-{i}"),
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        cb.open(&transient());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }
}
