//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Account GitHub tokens should come from `token_env` or `token_file`;
//! an inline `token` is accepted for local setups.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use copilot_pool::{Credential, Strategy};
use response_cache::CacheConfig;
use serde::Deserialize;
use upstream::retry::DEFAULT_RETRYABLE_STATUSES;
use upstream::{ClientConfig, RateGate, RetryPolicy};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
}

/// Listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener; omit to disable the admin API
    pub admin_addr: Option<SocketAddr>,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 4141)),
            admin_addr: Some(SocketAddr::from(([127, 0, 0, 1], 4142))),
            max_connections: 1000,
        }
    }
}

/// Copilot and GitHub endpoints
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub copilot_url: String,
    pub github_api_url: String,
    /// Deadline for chat and embeddings calls
    pub timeout_secs: u64,
    /// Deadline for token exchange and user lookup
    pub auxiliary_timeout_secs: u64,
    pub vscode_version: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            copilot_url: client.base_url,
            github_api_url: copilot_auth::GITHUB_API_URL.to_string(),
            timeout_secs: 300,
            auxiliary_timeout_secs: 15,
            vscode_version: client.vscode_version,
        }
    }
}

impl UpstreamConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.copilot_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            vscode_version: self.vscode_version.clone(),
        }
    }

    pub fn auxiliary_timeout(&self) -> Duration {
        Duration::from_secs(self.auxiliary_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the pool and cache documents. A leading `~/` expands
    /// to `$HOME`.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.local/share/copilot-gateway"),
        }
    }
}

impl StorageConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// When false only the first account is used.
    pub enabled: bool,
    pub strategy: Strategy,
    /// Bench time for a 429 that carried no `retry-after`
    pub rate_limit_cooldown_secs: u64,
    pub accounts: Vec<AccountConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: Strategy::RoundRobin,
            rate_limit_cooldown_secs: 60,
            accounts: Vec::new(),
        }
    }
}

/// One configured GitHub account
#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Environment variable holding the GitHub token
    #[serde(default)]
    pub token_env: Option<String>,
    /// File containing the GitHub token
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(skip)]
    pub resolved_token: Option<Secret<String>>,
}

impl AccountConfig {
    /// Token resolution order: `token_env`, then `token_file`, then `token`.
    fn resolve_token(&mut self) -> common::Result<()> {
        let inline = self.token.take();
        if let Some(var) = &self.token_env
            && let Ok(token) = std::env::var(var)
            && !token.trim().is_empty()
        {
            self.resolved_token = Some(Secret::new(token.trim().to_owned()));
            return Ok(());
        }
        if let Some(path) = &self.token_file {
            let token = std::fs::read_to_string(path).map_err(|e| {
                common::Error::Config(format!(
                    "account {}: failed to read token_file {}: {e}",
                    self.id,
                    path.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                self.resolved_token = Some(Secret::new(token));
                return Ok(());
            }
        }
        if let Some(token) = inline
            && !token.trim().is_empty()
        {
            self.resolved_token = Some(Secret::new(token.trim().to_owned()));
            return Ok(());
        }
        Err(common::Error::Config(format!(
            "account {} has no token (set token_env, token_file, or token)",
            self.id
        )))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            enabled: true,
            max_size: defaults.max_size,
            ttl_seconds: defaults.ttl.as_secs(),
        }
    }
}

impl CacheSettings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.max_size,
            ttl: Duration::from_secs(self.ttl_seconds),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            retryable_statuses: self.retryable_statuses.clone(),
            ..RetryPolicy::default()
        }
    }
}

/// Minimum spacing between upstream requests, shared by every account
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// 0 disables pacing
    pub interval_secs: u64,
    /// Sleep out the interval instead of failing with 429
    pub wait: bool,
}

impl RateLimitSettings {
    pub fn gate(&self) -> Option<RateGate> {
        (self.interval_secs > 0)
            .then(|| RateGate::new(Duration::from_secs(self.interval_secs), self.wait))
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, and resolve every
    /// account token.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        for account in &mut config.pool.accounts {
            account.resolve_token()?;
        }
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("copilot_url", &self.upstream.copilot_url),
            ("github_api_url", &self.upstream.github_api_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.upstream.timeout_secs == 0 || self.upstream.auxiliary_timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs and auxiliary_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.pool.accounts.is_empty() {
            return Err(common::Error::Config(
                "at least one [[pool.accounts]] entry is required".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.pool.accounts {
            if account.id.trim().is_empty() {
                return Err(common::Error::Config("account id must not be empty".into()));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate account id: {}",
                    account.id
                )));
            }
        }

        if self.cache.enabled && self.cache.max_size == 0 {
            return Err(common::Error::Config(
                "cache.max_size must be greater than 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(common::Error::Config(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }

        Ok(())
    }

    /// Accounts to seed the pool with. Single-credential mode keeps only
    /// the first configured account.
    pub fn credentials(&self) -> Vec<Credential> {
        let take = if self.pool.enabled {
            self.pool.accounts.len()
        } else {
            1
        };
        self.pool
            .accounts
            .iter()
            .take(take)
            .filter_map(|a| {
                a.resolved_token
                    .clone()
                    .map(|token| Credential::new(a.id.clone(), token, a.login.clone()))
            })
            .collect()
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.pool.rate_limit_cooldown_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("copilot-gateway.toml")
    }
}
