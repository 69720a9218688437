//! Fault classification.
//!
//! Remote errors arrive as free-form names and messages (auth service error
//! bodies, `error` frames on the stream). Every component maps them through
//! [`classify`] so the matching patterns exist in one place only.

use std::fmt;

/// Closed set of fault categories the resilience layer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotAuthorized,
    TokenExpired,
    TokenInvalid,
    TokenRevoked,
    RateExceeded,
    PermissionDenied,
    NotFound,
    Network,
    Timeout,
    Protocol,
    /// Reconnection attempts for a subscription ran out.
    Exhausted,
    Unknown,
}

impl ErrorKind {
    /// Fatal for the session: opens the breaker immediately and clears cached
    /// credentials.
    pub fn is_fatal_auth(self) -> bool {
        matches!(
            self,
            ErrorKind::NotAuthorized
                | ErrorKind::TokenExpired
                | ErrorKind::TokenInvalid
                | ErrorKind::TokenRevoked
                | ErrorKind::RateExceeded
        )
    }

    /// Fatal for a single subscription: it must not be reconnected.
    pub fn is_fatal_subscription(self) -> bool {
        matches!(
            self,
            ErrorKind::PermissionDenied | ErrorKind::NotFound | ErrorKind::NotAuthorized
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotAuthorized => "not_authorized",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::TokenInvalid => "token_invalid",
            ErrorKind::TokenRevoked => "token_revoked",
            ErrorKind::RateExceeded => "rate_exceeded",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered rule table. Patterns are matched case-insensitively against
/// `"{name} {message}"`; the first hit wins, so the more specific token
/// patterns come before the generic authorization ones.
const RULES: &[(&str, ErrorKind)] = &[
    ("revoked", ErrorKind::TokenRevoked),
    ("tokenexpired", ErrorKind::TokenExpired),
    ("token expired", ErrorKind::TokenExpired),
    ("token has expired", ErrorKind::TokenExpired),
    ("expired token", ErrorKind::TokenExpired),
    ("invalidtoken", ErrorKind::TokenInvalid),
    ("invalid token", ErrorKind::TokenInvalid),
    ("token is invalid", ErrorKind::TokenInvalid),
    ("invalid refresh token", ErrorKind::TokenInvalid),
    ("toomanyrequests", ErrorKind::RateExceeded),
    ("too many requests", ErrorKind::RateExceeded),
    ("rate exceeded", ErrorKind::RateExceeded),
    ("limitexceeded", ErrorKind::RateExceeded),
    ("throttl", ErrorKind::RateExceeded),
    ("notauthorized", ErrorKind::NotAuthorized),
    ("not authorized", ErrorKind::NotAuthorized),
    ("unauthorized", ErrorKind::NotAuthorized),
    ("permission denied", ErrorKind::PermissionDenied),
    ("accessdenied", ErrorKind::PermissionDenied),
    ("access denied", ErrorKind::PermissionDenied),
    ("forbidden", ErrorKind::PermissionDenied),
    ("notfound", ErrorKind::NotFound),
    ("not found", ErrorKind::NotFound),
    ("timed out", ErrorKind::Timeout),
    ("timeout", ErrorKind::Timeout),
    ("connection refused", ErrorKind::Network),
    ("connection reset", ErrorKind::Network),
    ("network", ErrorKind::Network),
];

/// Classify a remote error by its name and message.
pub fn classify(name: &str, message: &str) -> ErrorKind {
    let haystack = format!("{name} {message}").to_ascii_lowercase();
    RULES
        .iter()
        .find(|(pattern, _)| haystack.contains(pattern))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// A classified failure reported to the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: ErrorKind,
    pub detail: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Build a fault from a remote error name and message.
    pub fn classify(name: &str, message: &str) -> Self {
        Self {
            kind: classify(name, message),
            detail: if name.is_empty() {
                message.to_string()
            } else {
                format!("{name}: {message}")
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal_auth()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)
    }
}
