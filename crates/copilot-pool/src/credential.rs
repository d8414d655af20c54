//! Account record, selection strategy, and the admin-facing status view

use std::fmt;
use std::str::FromStr;

use common::Secret;
use serde::{Deserialize, Serialize};

/// One upstream account.
///
/// Eligible for selection iff `active && !standby && !rate_limited && !paused`.
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    /// Long-lived GitHub OAuth token
    pub token: Secret<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(default)]
    pub rate_limit_reset_at: Option<u64>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub last_used: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Held out of rotation for this process only. Never persisted, so a
    /// later run with a different configuration starts from the real flags.
    #[serde(skip)]
    pub standby: bool,
}

fn default_active() -> bool {
    true
}

impl Credential {
    pub fn new(id: impl Into<String>, token: Secret<String>, login: Option<String>) -> Self {
        Self {
            id: id.into(),
            token,
            login,
            active: true,
            rate_limited: false,
            rate_limit_reset_at: None,
            paused: false,
            request_count: 0,
            error_count: 0,
            last_used: None,
            last_error: None,
            standby: false,
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.active && !self.standby && !self.rate_limited && !self.paused
    }

    /// Clear an expired rate limit. Returns true if the flag changed.
    pub(crate) fn clear_expired_rate_limit(&mut self, now_ms: u64) -> bool {
        match (self.rate_limited, self.rate_limit_reset_at) {
            (true, Some(reset_at)) if reset_at <= now_ms => {
                self.rate_limited = false;
                self.rate_limit_reset_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn status_label(&self) -> &'static str {
        if !self.active {
            "inactive"
        } else if self.standby {
            "standby"
        } else if self.paused {
            "paused"
        } else if self.rate_limited {
            "rate_limited"
        } else {
            "active"
        }
    }
}

/// Account selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Keep the previous account until it becomes ineligible
    Sticky,
    /// Advance a cursor through the accounts on every call
    #[default]
    RoundRobin,
    /// Oldest `last_used` first
    LeastRecentlyUsed,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Sticky => "sticky",
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastRecentlyUsed => "least-recently-used",
        })
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sticky" => Ok(Strategy::Sticky),
            "round-robin" | "round_robin" => Ok(Strategy::RoundRobin),
            "least-recently-used" | "lru" => Ok(Strategy::LeastRecentlyUsed),
            other => Err(format!(
                "unknown pool strategy {other:?} (expected sticky, round-robin, least-recently-used)"
            )),
        }
    }
}

/// Per-account status for the admin API. Never carries tokens.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub id: String,
    pub login: Option<String>,
    pub status: &'static str,
    pub eligible: bool,
    pub request_count: u64,
    pub error_count: u64,
    pub last_used: Option<u64>,
    pub last_error: Option<String>,
    pub rate_limit_reset_at: Option<u64>,
    /// Expiry of the current Copilot token, if one has been obtained
    pub token_expires_at: Option<u64>,
}

impl AccountStatus {
    pub(crate) fn from_credential(credential: &Credential, token_expires_at: Option<u64>) -> Self {
        Self {
            id: credential.id.clone(),
            login: credential.login.clone(),
            status: credential.status_label(),
            eligible: credential.is_eligible(),
            request_count: credential.request_count,
            error_count: credential.error_count,
            last_used: credential.last_used,
            last_error: credential.last_error.clone(),
            rate_limit_reset_at: credential.rate_limit_reset_at,
            token_expires_at,
        }
    }
}
