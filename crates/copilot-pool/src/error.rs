//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No eligible account. The message breaks down why.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("account already exists: {0}")]
    Duplicate(String),

    /// Token endpoint rejected the account's GitHub token; it was deactivated.
    #[error("account {id} deactivated: {message}")]
    Deactivated { id: String, message: String },

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error(transparent)]
    Storage(#[from] common::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
