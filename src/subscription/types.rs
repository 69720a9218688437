//! Subscription requests, lifecycle states, events and errors.

use serde_json::Value;
use thiserror::Error;

use crate::resilience::classify::Fault;
use crate::subscription::registry::Subscription;

/// One logical stream a caller wants to follow.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub topic: String,
    pub scope_id: String,
    /// Sent verbatim as the `start` frame payload.
    pub payload: Value,
}

impl SubscriptionRequest {
    pub fn new(topic: impl Into<String>, scope_id: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            scope_id: scope_id.into(),
            payload,
        }
    }

    pub fn key(&self) -> String {
        Subscription::key_for(&self.topic, &self.scope_id)
    }
}

/// Lifecycle of one logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    AwaitingAck,
    Subscribed,
    Reconnecting { attempt: u32 },
    Closing,
    Terminated,
}

impl SubscriptionState {
    pub fn is_terminated(self) -> bool {
        self == SubscriptionState::Terminated
    }
}

/// Why a subscription stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The server sent `complete`.
    Completed,
    /// The server closed the socket normally.
    ServerClosed,
    /// Cleanup ran: unsubscribe, handle dropped, or breaker mass-cancel.
    Cancelled,
    /// A non-reconnectable fault.
    Fatal(Fault),
    /// The breaker refused the next reconnect.
    CircuitOpen,
    /// Reconnect attempts ran out.
    Exhausted { attempts: u32 },
}

/// Delivered to the subscriber in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Data(Value),
    Error(Fault),
    Terminated(TerminationReason),
}

/// Process-wide streaming connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("invalid streaming endpoint: {0}")]
    InvalidEndpoint(String),
}

pub type StreamResult<T> = Result<T, StreamError>;
