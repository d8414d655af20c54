//! Credential pool for GitHub Copilot accounts
//!
//! Holds every upstream account, its health and rate-limit state, and the
//! selection policy. Each account keeps a long-lived GitHub token; the pool
//! exchanges it for short-lived Copilot tokens on demand and in the
//! background.
//!
//! Account lifecycle:
//! 1. Loaded from config (merged with the persisted pool document) or added
//!    via the admin API, `active`
//! 2. `select` picks an eligible account per strategy and returns its live
//!    Copilot token, refreshing inline when it is about to expire
//! 3. Upstream 429 → `report_rate_limited`, benched until its reset time,
//!    cleared lazily on a later `select`
//! 4. Token-endpoint 401/403 → deactivated
//! 5. Admin pause/resume/activate; removal marks the account inactive
//! 6. Every mutation schedules a debounced write of the pool document

pub mod credential;
pub mod error;
pub mod pool;
pub mod refresh;

pub use credential::{AccountStatus, Credential, Strategy};
pub use error::{Error, Result};
pub use pool::{POOL_DOCUMENT, Pool, SelectedAccount};
pub use refresh::{refresh_with_retry, spawn_refresh_task};
