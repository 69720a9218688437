//! Credential resolution.
//!
//! # Data Flow
//! ```text
//! resolve()
//!     → in-memory cache (fresh enough?)
//!     → throttle (min spacing between fetches)
//!     → persistent token store (enough lifetime left?)
//!     → auth service refresh, single-flight under the `token-refresh` lock
//!     → authenticated-session fallback (near-expiry credential, short cache)
//!     → AuthError::Unavailable
//! ```
//!
//! # Design Decisions
//! - The cache is an `ArcSwapOption`; readers never block on a refresh
//! - Fatal classifications clear the cache and stop the chain immediately
//! - Cache validity is tracked on the tokio clock, credential expiry on the
//!   wall clock (it is persisted)

pub mod provider;
pub mod service;
pub mod store;
pub mod types;

pub use provider::{TokenProvider, REFRESH_LOCK};
pub use service::{AuthService, HttpAuthService};
pub use store::{MemoryTokenStore, StorageTokenStore, TokenStore};
pub use types::{AuthError, AuthResult, AuthServiceError, CachedCredential, Credential};

/// Something holding credentials that the circuit breaker can wipe when a
/// fatal auth fault is observed.
pub trait CredentialCache: Send + Sync {
    fn clear_cached(&self);
}
