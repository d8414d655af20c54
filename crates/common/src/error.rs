//! Common error types

use thiserror::Error;

/// Common error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted cache document could not be parsed. Recovered by discarding it.
    #[error("cache document corrupt: {0}")]
    CacheCorrupt(String),

    /// Persisted pool document could not be parsed. Recovered with defaults.
    #[error("pool document invalid: {0}")]
    ConfigInvalid(String),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
