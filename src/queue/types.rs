//! Queue item types, options, stats and errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::storage::StorageError;

/// Drain order. `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// A deferred mutating call. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub priority: Priority,
    pub enqueued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

impl QueuedOperation {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| now_ms >= at)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Falls back to the queue's configured default.
    pub max_retries: Option<u32>,
    pub room_id: Option<String>,
    pub expires_in: Option<Duration>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }
}

/// Result of `execute_or_enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Ran immediately; carries the executor's result.
    Executed(Value),
    /// Deferred for replay.
    Queued { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub oldest_enqueued_at: Option<u64>,
    pub draining: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Expired,
    RetriesExhausted,
    Evicted,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Expired => "expired",
            DropReason::RetriesExhausted => "retries_exhausted",
            DropReason::Evicted => "evicted",
        }
    }
}

/// An operation removed without succeeding.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedOperation {
    pub operation: QueuedOperation,
    pub reason: DropReason,
    pub last_error: Option<String>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Connectivity dropped mid-pass.
    pub interrupted: bool,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({capacity} operations) and nothing can be evicted")]
    Full { capacity: usize },

    #[error("queue storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type QueueResult<T> = Result<T, QueueError>;
