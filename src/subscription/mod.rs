//! Streaming subscriptions.
//!
//! # Data Flow
//! ```text
//! subscribe(request)
//!     → CircuitBreaker::can_proceed (fail fast when open)
//!     → registry.add (cleanup = cancel the supervising task)
//!     → supervising task:
//!         resolve credential → open socket (auth in query)
//!         → connection_init → connection_ack → start
//!         → data* (record_success) | error (record_failure)
//!         → on abnormal close: backoff, can_proceed, retry
//!     → registry.remove_if_current on exit
//! ```
//!
//! # Design Decisions
//! - Registry keys are `topic:scope_id`; re-subscribing replaces the old entry
//! - Mass-cancel detaches every entry before running its cleanup

pub mod connection;
pub mod protocol;
pub mod registry;
pub mod target;
pub mod types;

pub use connection::{ConnectionManager, SubscriptionHandle};
pub use protocol::{Frame, SUB_PROTOCOL};
pub use registry::{Subscription, SubscriptionRegistry};
pub use types::{
    ConnectionStatus, StreamError, StreamResult, SubscriptionEvent, SubscriptionRequest,
    SubscriptionState, TerminationReason,
};
