//! Error classification for Copilot API responses
//!
//! Drives credential state transitions in the pool: a rate limit benches the
//! account until its reset time, an auth failure deactivates it, everything
//! else is left to the invoker's retry predicate.

/// What a failed upstream status means for the credential that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Not the credential's fault (timeouts, 5xx, bad request)
    Transient,
    /// Credential rate limited, rotate away until reset
    RateLimited,
    /// Token revoked or Copilot access removed (401/403), deactivate
    Permanent,
}

/// Classify an upstream error by HTTP status.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        429 => ErrorClassification::RateLimited,
        401 | 403 => ErrorClassification::Permanent,
        _ => ErrorClassification::Transient,
    }
}
