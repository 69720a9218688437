//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Connection attempt:
//!     → circuit_breaker.rs (may we try at all?)
//!     → On failure: classify.rs (fatal auth? transient? non-reconnectable?)
//!     → circuit_breaker.rs (count failure, open + mass-cancel on threshold/fatal)
//!     → backoff.rs (delay before the next attempt)
//! ```
//!
//! # Design Decisions
//! - One breaker per application context, shared by every subscription
//! - Fault classification lives in exactly one rule table
//! - Jittered backoff prevents synchronized reconnection storms

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;

pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use classify::{ErrorKind, Fault};
