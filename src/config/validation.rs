//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ratios in range)
//! - Validate endpoint URLs and socket addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::ResilienceConfig;

/// A single semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::new(field, "must be greater than zero"));
    }
}

fn url_with_scheme(errors: &mut Vec<ValidationError>, field: &str, value: &str, schemes: &[&str]) {
    match Url::parse(value) {
        Ok(url) if schemes.contains(&url.scheme()) => {}
        Ok(url) => errors.push(ValidationError::new(
            field,
            format!("unsupported scheme '{}' (expected one of {:?})", url.scheme(), schemes),
        )),
        Err(e) => errors.push(ValidationError::new(field, format!("invalid URL: {e}"))),
    }
}

/// Check every bound in `config`.
pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let breaker = &config.breaker;
    positive(&mut errors, "breaker.failure_threshold", breaker.failure_threshold.into());
    positive(&mut errors, "breaker.open_timeout_secs", breaker.open_timeout_secs);
    positive(&mut errors, "breaker.probe_timeout_secs", breaker.probe_timeout_secs);

    let token = &config.token;
    positive(&mut errors, "token.max_cache_secs", token.max_cache_secs);
    positive(&mut errors, "token.fallback_cache_secs", token.fallback_cache_secs);
    if token.buffer_before_use_secs > token.refresh_buffer_secs {
        errors.push(ValidationError::new(
            "token.buffer_before_use_secs",
            "must not exceed token.refresh_buffer_secs",
        ));
    }

    url_with_scheme(&mut errors, "auth.refresh_url", &config.auth.refresh_url, &["http", "https"]);
    positive(&mut errors, "auth.request_timeout_secs", config.auth.request_timeout_secs);

    let conn = &config.connection;
    url_with_scheme(
        &mut errors,
        "connection.endpoint",
        &conn.endpoint,
        &["ws", "wss", "http", "https"],
    );
    positive(&mut errors, "connection.connect_timeout_secs", conn.connect_timeout_secs);
    positive(&mut errors, "connection.keepalive_interval_secs", conn.keepalive_interval_secs);
    positive(&mut errors, "connection.reconnect_base_ms", conn.reconnect_base_ms);
    positive(&mut errors, "connection.event_buffer", conn.event_buffer as u64);
    if conn.reconnect_cap_ms < conn.reconnect_base_ms {
        errors.push(ValidationError::new(
            "connection.reconnect_cap_ms",
            "must be at least connection.reconnect_base_ms",
        ));
    }
    if !(0.0..=1.0).contains(&conn.jitter_ratio) {
        errors.push(ValidationError::new("connection.jitter_ratio", "must be within 0.0..=1.0"));
    }

    let queue = &config.queue;
    positive(&mut errors, "queue.capacity", queue.capacity as u64);
    positive(&mut errors, "queue.default_max_retries", queue.default_max_retries.into());
    positive(&mut errors, "queue.reschedule_base_ms", queue.reschedule_base_ms);
    if queue.storage_key.trim().is_empty() {
        errors.push(ValidationError::new("queue.storage_key", "must not be empty"));
    }

    let locks = &config.locks;
    positive(&mut errors, "locks.default_ttl_secs", locks.default_ttl_secs);
    positive(&mut errors, "locks.max_concurrent_operations", locks.max_concurrent_operations as u64);
    positive(&mut errors, "locks.queue_timeout_secs", locks.queue_timeout_secs);
    positive(&mut errors, "locks.sweep_interval_secs", locks.sweep_interval_secs);
    positive(&mut errors, "locks.deadlock_threshold_secs", locks.deadlock_threshold_secs);

    if config.storage.directory.trim().is_empty() {
        errors.push(ValidationError::new("storage.directory", "must not be empty"));
    }

    let obs = &config.observability;
    if !matches!(obs.log_level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", obs.log_level),
        ));
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", obs.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
