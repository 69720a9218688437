//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start (AppContext::start):
//!     restore queue → spawn lock sweeper → spawn queue worker
//!
//! Stop (AppContext::stop):
//!     Shutdown::trigger → background loops exit → mass-cancel subscriptions
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → stop
//! ```
//!
//! # Design Decisions
//! - Background loops own a broadcast receiver and exit on the first signal
//! - Stop is idempotent

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
