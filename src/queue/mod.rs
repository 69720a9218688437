//! Offline operation queue.
//!
//! # Data Flow
//! ```text
//! execute_or_enqueue(kind, payload, executor, options)
//!     → online: run executor → success returns its result
//!     → offline or failure: priority insert → persist → publish stats
//!
//! Worker (run):
//!     connectivity restored / new work / retry timer
//!     → drain pass over a snapshot (expired dropped, executor per kind)
//!     → items left: next pass after min(base·2^avg_retries, cap)
//! ```
//!
//! # Design Decisions
//! - Delivery is at-least-once; executors must tolerate replays
//! - The whole list is re-serialized on every mutation
//! - Dropped operations are broadcast so callers can surface them

pub mod connectivity;
pub mod executors;
pub mod operation_queue;
pub mod types;

pub use connectivity::ConnectivitySignal;
pub use executors::{Executor, ExecutorRegistry, ExecutorResult};
pub use operation_queue::OperationQueue;
pub use types::{
    DrainReport, DropReason, DroppedOperation, EnqueueOptions, ExecutionOutcome, Priority,
    QueueError, QueueResult, QueueStats, QueuedOperation,
};
