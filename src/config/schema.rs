//! Configuration schema definitions.
//!
//! Every section derives Serde traits and carries `#[serde(default)]` so a
//! config file only needs the values it changes. Durations are integers with
//! the unit in the field name.

use serde::{Deserialize, Serialize};

/// Root configuration for the resilience layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Circuit breaker guarding streaming connection attempts.
    pub breaker: BreakerConfig,

    /// Credential caching and fetch throttling.
    pub token: TokenConfig,

    /// Remote auth service.
    pub auth: AuthConfig,

    /// Streaming connection and reconnection.
    pub connection: ConnectionConfig,

    /// Offline operation queue.
    pub queue: QueueConfig,

    /// Named lock manager.
    pub locks: LockConfig,

    /// Durable storage for tokens and the queue.
    pub storage: StorageConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive transient failures before opening.
    pub failure_threshold: u32,

    /// How long the breaker stays open.
    pub open_timeout_secs: u64,

    /// Admit one probe at a time while half-open.
    pub single_probe: bool,

    /// A probe that has not reported back within this window frees its slot.
    pub probe_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout_secs: 60,
            single_probe: true,
            probe_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// A cached credential is served only while it has at least this much
    /// lifetime left.
    pub buffer_before_use_secs: u64,

    /// A stored credential is accepted only with more than this much lifetime
    /// left; otherwise it is refreshed.
    pub refresh_buffer_secs: u64,

    /// Minimum spacing between credential fetches.
    pub min_fetch_interval_ms: u64,

    /// Upper bound on how long a credential stays in the in-memory cache.
    pub max_cache_secs: u64,

    /// Cache duration for a near-expiry credential accepted as a last resort.
    pub fallback_cache_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            buffer_before_use_secs: 30,
            refresh_buffer_secs: 300,
            min_fetch_interval_ms: 2_000,
            max_cache_secs: 60,
            fallback_cache_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token refresh endpoint.
    pub refresh_url: String,

    /// Client identifier sent with refresh requests.
    pub client_id: String,

    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_url: "http://127.0.0.1:8081/token/refresh".to_string(),
            client_id: String::new(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Streaming endpoint. `http(s)` schemes are rewritten to `ws(s)`.
    pub endpoint: String,

    /// Bound on socket open plus `connection_ack`.
    pub connect_timeout_secs: u64,

    /// Interval between client `ping` frames.
    pub keepalive_interval_secs: u64,

    /// Reconnect attempts per logical subscription before giving up.
    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubled per attempt.
    pub reconnect_base_ms: u64,

    /// Reconnect delay ceiling before jitter.
    pub reconnect_cap_ms: u64,

    /// Upper bound of the multiplicative jitter.
    pub jitter_ratio: f64,

    /// Buffered events per subscription handle.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8082/graphql/realtime".to_string(),
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            jitter_ratio: 0.1,
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued operations.
    pub capacity: usize,

    /// Attempts per operation when the caller does not say.
    pub default_max_retries: u32,

    /// Pause between operations within one drain pass.
    pub drain_item_delay_ms: u64,

    /// Base of the retry-pass reschedule delay.
    pub reschedule_base_ms: u64,

    /// Ceiling of the retry-pass reschedule delay.
    pub reschedule_cap_ms: u64,

    /// Storage key the queue is persisted under.
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            default_max_retries: 3,
            drain_item_delay_ms: 100,
            reschedule_base_ms: 5_000,
            reschedule_cap_ms: 60_000,
            storage_key: "offline-queue".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL applied when the caller does not give one.
    pub default_ttl_secs: u64,

    /// Maximum locks held at once across all names.
    pub max_concurrent_operations: usize,

    /// Queue contending callers instead of failing them.
    pub queue_enabled: bool,

    /// Maximum waiters per lock name.
    pub max_queue_size: usize,

    /// How long a waiter may wait.
    pub queue_timeout_secs: u64,

    /// Sweeper period.
    pub sweep_interval_secs: u64,

    /// Locks held longer than this are reported as suspected deadlocks.
    pub deadlock_threshold_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
            max_concurrent_operations: 10,
            queue_enabled: true,
            max_queue_size: 10,
            queue_timeout_secs: 120,
            sweep_interval_secs: 30,
            deadlock_threshold_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Directory for the file backend.
    pub directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            directory: ".resilient-client".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
