//! Common types for the Copilot gateway

mod error;
mod persist;
mod secret;
mod store;

pub use error::{Error, Result};
pub use persist::{Debouncer, spawn_debounced};
pub use secret::Secret;
pub use store::JsonStore;

/// Current wall-clock time as unix milliseconds.
///
/// All persisted timestamps (rate-limit resets, token expiry, cache access
/// times) use this representation so they survive restarts.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
