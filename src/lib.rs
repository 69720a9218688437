//! Network resilience layer for a client talking to a token-issuing auth
//! service and a WebSocket publish/subscribe endpoint.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller ──subscribe──▶ ConnectionManager ──can_proceed──▶ CircuitBreaker
//!                              │                                  │ open
//!                              │ resolve                          ▼
//!                              ▼                          SubscriptionRegistry
//!                         TokenProvider ──token-refresh──▶ LockManager   (mass-cancel)
//!                              │
//!                              ▼
//!                    auth service / token store
//!
//!   caller ──execute_or_enqueue──▶ OperationQueue ──▶ executors (kind → fn)
//!                                       │
//!                              storage + ConnectivitySignal
//! ```

// Core subsystems
pub mod auth;
pub mod locks;
pub mod queue;
pub mod subscription;

// Cross-cutting concerns
pub mod clock;
pub mod config;
pub mod context;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod storage;

pub use config::ResilienceConfig;
pub use context::AppContext;
pub use lifecycle::Shutdown;
