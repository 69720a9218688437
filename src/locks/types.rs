//! Lock manager types and errors.

use std::time::Duration;

use thiserror::Error;

/// Errors from lock acquisition. None of these are fatal to the rest of the
/// system; callers decide whether to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock '{name}' is already held")]
    AlreadyLocked { name: String },

    #[error("too many concurrent locks held (max {max})")]
    CapacityExceeded { max: usize },

    #[error("wait queue for lock '{name}' is full")]
    QueueFull { name: String },

    #[error("timed out after {waited:?} waiting for lock '{name}'")]
    QueueTimeout { name: String, waited: Duration },
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Public view of a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub name: String,
    pub held_for: Duration,
    pub expires_in: Duration,
}

/// Aggregate lock table statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    pub held: usize,
    pub waiting: usize,
    /// Locks held longer than the deadlock threshold. Advisory only.
    pub suspected_deadlocks: Vec<String>,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub newly_flagged: Vec<String>,
    pub abandoned_waiters: usize,
}
