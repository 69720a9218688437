//! Metrics collection and exposition.
//!
//! # Metrics
//! - `resilience_breaker_transitions_total` (counter): by target `state`
//! - `resilience_subscriptions_active` (gauge): registry size
//! - `resilience_subscription_events_total` (counter): by `event`
//! - `resilience_reconnects_total` (counter)
//! - `resilience_connect_duration_seconds` (histogram): socket open to ack
//! - `resilience_token_resolutions_total` (counter): by `source`
//! - `resilience_queue_depth` (gauge)
//! - `resilience_queue_dropped_total` (counter): by `reason`
//! - `resilience_lock_contention_total` (counter): by `outcome`
//! - `resilience_locks_held` (gauge)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_breaker_transition(state: &'static str) {
    counter!("resilience_breaker_transitions_total", "state" => state).increment(1);
}

pub fn record_registry_size(size: usize) {
    gauge!("resilience_subscriptions_active").set(size as f64);
}

pub fn record_subscription_event(event: &'static str) {
    counter!("resilience_subscription_events_total", "event" => event).increment(1);
}

pub fn record_reconnect() {
    counter!("resilience_reconnects_total").increment(1);
}

pub fn record_connect_duration(elapsed: Duration) {
    histogram!("resilience_connect_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_token_resolution(source: &'static str) {
    counter!("resilience_token_resolutions_total", "source" => source).increment(1);
}

pub fn record_queue_depth(depth: usize) {
    gauge!("resilience_queue_depth").set(depth as f64);
}

pub fn record_queue_dropped(reason: &'static str) {
    counter!("resilience_queue_dropped_total", "reason" => reason).increment(1);
}

pub fn record_lock_contention(outcome: &'static str) {
    counter!("resilience_lock_contention_total", "outcome" => outcome).increment(1);
}

pub fn record_locks_held(held: usize) {
    gauge!("resilience_locks_held").set(held as f64);
}
