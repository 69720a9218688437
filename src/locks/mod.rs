//! Named-lock subsystem.
//!
//! # Data Flow
//! ```text
//! with_lock(name, f):
//!     → try_acquire (fails if held or at max_concurrent_operations)
//!     → on contention: FIFO wait queue (bounded, per-waiter timeout)
//!     → f() runs while the guard is alive
//!     → guard drop releases and hands the lock to the next waiter
//!
//! Sweeper (every sweep_interval_secs):
//!     → force-release locks past their TTL
//!     → flag locks held past deadlock_threshold_secs
//!     → resume waiters
//! ```
//!
//! # Design Decisions
//! - One lock table behind a mutex; all transitions happen under it
//! - A waiter resolves exactly once: granted or timed out
//! - `force_release` and `clear_all` bypass ownership and resume waiters
//! - Releasing a lock that already expired is a no-op for the stale holder

pub mod manager;
pub mod types;

pub use manager::{LockGuard, LockManager};
pub use types::{LockError, LockInfo, LockResult, LockStats, SweepReport};
