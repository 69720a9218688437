//! Credential types and auth errors.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::locks::LockError;
use crate::resilience::classify::{ErrorKind, Fault};
use crate::storage::StorageError;

/// Tokens issued by the auth service. `expires_at` is epoch milliseconds.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub id_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: u64,
}

impl Credential {
    /// Lifetime left at `now_ms`.
    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_ms))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("id_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A credential held in memory together with how long it may be served.
#[derive(Debug, Clone)]
pub struct CachedCredential {
    pub credential: Credential,
    pub fetched_at: Instant,
    pub valid_until: Instant,
}

impl CachedCredential {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.valid_until
    }
}

/// Error reported by the auth service: `{name, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct AuthServiceError {
    pub name: String,
    pub message: String,
}

impl AuthServiceError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn fault(&self) -> Fault {
        Fault::classify(&self.name, &self.message)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The auth service rejected the session; retrying will not help.
    #[error("authentication rejected: {0}")]
    Fatal(Fault),

    /// Every source was exhausted. `last_error` is the transient failure seen
    /// on the way, if any.
    #[error("no usable credential{}", describe_last(.last_error))]
    Unavailable { last_error: Option<Fault> },

    #[error("token store error: {0}")]
    Store(#[from] StorageError),

    #[error("token refresh lock: {0}")]
    Lock(#[from] LockError),
}

fn describe_last(last_error: &Option<Fault>) -> String {
    match last_error {
        Some(fault) => format!(" (last error: {fault})"),
        None => String::new(),
    }
}

impl AuthError {
    /// Classification reported to the circuit breaker. Having no credential
    /// at all counts as not authorized.
    pub fn fault(&self) -> Fault {
        match self {
            AuthError::Fatal(fault) => fault.clone(),
            AuthError::Unavailable {
                last_error: Some(fault),
            } => fault.clone(),
            AuthError::Unavailable { last_error: None } => {
                Fault::new(ErrorKind::NotAuthorized, "no valid authentication available")
            }
            AuthError::Store(e) => Fault::new(ErrorKind::Unknown, e.to_string()),
            AuthError::Lock(e) => Fault::new(ErrorKind::Timeout, e.to_string()),
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_tokens() {
        let credential = Credential {
            access_token: "secret-access".into(),
            id_token: "secret-id".into(),
            refresh_token: Some("secret-refresh".into()),
            expires_at: 1,
        };
        let printed = format!("{credential:?}");
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_unavailable_fault() {
        let err = AuthError::Unavailable { last_error: None };
        assert!(err.fault().is_fatal());

        let err = AuthError::Unavailable {
            last_error: Some(Fault::new(ErrorKind::Network, "reset")),
        };
        assert!(!err.fault().is_fatal());
        assert!(err.to_string().contains("reset"));
    }
}
