//! GitHub → Copilot token exchange
//!
//! Each pooled account holds a long-lived GitHub OAuth token. Copilot's chat
//! API only accepts the short-lived token minted by
//! `GET /copilot_internal/v2/token`, which expires roughly every 25 minutes.
//! This crate performs that exchange and the GitHub user lookup; scheduling
//! refreshes is the pool's job.

pub mod constants;
pub mod error;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use token::{CopilotToken, GithubUser, HttpTokenSource, TokenSource};
