//! Pool state, account selection, and rate-limit bookkeeping
//!
//! All account records live in one `PoolState` behind a `RwLock`, so compound
//! updates ("clear expired limits, pick, stamp last_used") are atomic with
//! respect to other requests. The list of eligible indices is cached and
//! dropped whenever an account's flags change.
//!
//! Short-lived Copilot tokens are kept in a separate map: they are never
//! persisted and are refreshed far more often than account state changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use common::{Debouncer, JsonStore, Secret, now_millis, spawn_debounced};
use copilot_auth::{CopilotToken, TokenSource};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credential::{AccountStatus, Credential, Strategy};
use crate::error::{Error, Result};

/// Store document holding pool membership, counters, and the rotation cursor.
pub const POOL_DOCUMENT: &str = "pool-state";

const DOCUMENT_VERSION: u32 = 1;

/// An account chosen for one request, with its live Copilot token.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub id: String,
    pub access_token: Secret<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    accounts: Vec<Credential>,
    #[serde(default)]
    cursor: usize,
    #[serde(default)]
    sticky_id: Option<String>,
    #[serde(default)]
    last_index: Option<usize>,
}

#[derive(Debug, Default)]
struct PoolState {
    accounts: Vec<Credential>,
    /// Round-robin position: index to start the next scan from
    cursor: usize,
    /// Account the sticky strategy keeps returning
    sticky_id: Option<String>,
    /// Index of the previous selection, for fallback-to-next
    last_index: Option<usize>,
    /// Cached indices of eligible accounts, `None` when stale
    eligible: Option<Vec<usize>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    total: usize,
    eligible: usize,
    rate_limited: usize,
    paused: usize,
    inactive: usize,
    standby: usize,
}

impl PoolState {
    fn new(accounts: Vec<Credential>) -> Self {
        Self {
            accounts,
            ..Self::default()
        }
    }

    fn invalidate(&mut self) {
        self.eligible = None;
    }

    fn eligible(&mut self) -> &[usize] {
        let accounts = &self.accounts;
        self.eligible.get_or_insert_with(|| {
            accounts
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_eligible())
                .map(|(i, _)| i)
                .collect()
        })
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.accounts.iter().position(|c| c.id == id)
    }

    /// Lazily lift rate limits whose reset time has passed.
    fn clear_expired(&mut self, now_ms: u64) -> bool {
        let mut changed = false;
        for credential in &mut self.accounts {
            if credential.clear_expired_rate_limit(now_ms) {
                info!(account_id = %credential.id, "rate limit reset, account eligible again");
                changed = true;
            }
        }
        if changed {
            self.invalidate();
        }
        changed
    }

    /// Choose an eligible account index per strategy, skipping `excluded`.
    ///
    /// Ties resolve in configured order.
    fn pick(&mut self, strategy: Strategy, excluded: &[String]) -> Option<usize> {
        let n = self.accounts.len();
        let candidates: Vec<usize> = self
            .eligible()
            .to_vec()
            .into_iter()
            .filter(|&i| !excluded.contains(&self.accounts[i].id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let scan_from = |start: usize| {
            (0..n)
                .map(|offset| (start + offset) % n)
                .find(|i| candidates.contains(i))
        };

        let idx = match strategy {
            Strategy::RoundRobin => {
                let idx = scan_from(self.cursor % n)?;
                self.cursor = (idx + 1) % n;
                idx
            }
            Strategy::Sticky => {
                let current = self
                    .sticky_id
                    .as_deref()
                    .and_then(|id| self.index_of(id))
                    .filter(|i| candidates.contains(i));
                match current {
                    Some(idx) => idx,
                    None => scan_from(self.last_index.map(|i| i + 1).unwrap_or(0))?,
                }
            }
            Strategy::LeastRecentlyUsed => *candidates
                .iter()
                .min_by_key(|&&i| self.accounts[i].last_used.unwrap_or(0))?,
        };

        self.sticky_id = Some(self.accounts[idx].id.clone());
        self.last_index = Some(idx);
        Some(idx)
    }

    fn counts(&self, now_ms: u64) -> Counts {
        let mut counts = Counts {
            total: self.accounts.len(),
            ..Counts::default()
        };
        for c in &self.accounts {
            let reset_passed = c.rate_limit_reset_at.is_some_and(|at| at <= now_ms);
            if !c.active {
                counts.inactive += 1;
            } else if c.standby {
                counts.standby += 1;
            } else if c.paused {
                counts.paused += 1;
            } else if c.rate_limited && !reset_passed {
                counts.rate_limited += 1;
            } else {
                counts.eligible += 1;
            }
        }
        counts
    }

    fn document(&self) -> PoolDocument {
        PoolDocument {
            version: DOCUMENT_VERSION,
            accounts: self.accounts.clone(),
            cursor: self.cursor,
            sticky_id: self.sticky_id.clone(),
            last_index: self.last_index,
        }
    }
}

/// Merge configured accounts with a persisted pool document.
///
/// Configured accounts keep their order, token, and login; runtime state
/// (flags, counters, timestamps) carries over from the document. Accounts
/// only present in the document were added through the admin API and are
/// appended.
fn merge(configured: Vec<Credential>, persisted: Option<PoolDocument>) -> PoolState {
    let Some(document) = persisted else {
        return PoolState::new(configured);
    };

    let mut saved = document.accounts;
    let mut accounts = Vec::with_capacity(configured.len() + saved.len());
    for mut credential in configured {
        if let Some(pos) = saved.iter().position(|s| s.id == credential.id) {
            let previous = saved.remove(pos);
            credential.active = previous.active;
            credential.paused = previous.paused;
            credential.rate_limited = previous.rate_limited;
            credential.rate_limit_reset_at = previous.rate_limit_reset_at;
            credential.request_count = previous.request_count;
            credential.error_count = previous.error_count;
            credential.last_used = previous.last_used;
            credential.last_error = previous.last_error;
            if credential.login.is_none() {
                credential.login = previous.login;
            }
        }
        accounts.push(credential);
    }
    accounts.extend(saved);

    let n = accounts.len();
    PoolState {
        cursor: if n == 0 { 0 } else { document.cursor % n },
        sticky_id: document.sticky_id,
        last_index: document.last_index.filter(|&i| i < n),
        accounts,
        eligible: None,
    }
}

/// Per-account exchange slot. Holding `last_failure` means owning the one
/// in-flight exchange for that account.
#[derive(Debug, Default)]
struct ExchangeSlot {
    /// Bumped when an exchange finishes
    completed: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

/// Credential pool shared by every request handler.
pub struct Pool {
    state: RwLock<PoolState>,
    tokens: RwLock<HashMap<String, CopilotToken>>,
    exchanges: Mutex<HashMap<String, Arc<ExchangeSlot>>>,
    token_source: Arc<dyn TokenSource>,
    store: Option<Arc<JsonStore>>,
    debouncer: OnceLock<Debouncer>,
}

impl Pool {
    /// In-memory pool without persistence.
    pub fn new(accounts: Vec<Credential>, token_source: Arc<dyn TokenSource>) -> Self {
        info!(accounts = accounts.len(), "pool initialized");
        Self {
            state: RwLock::new(PoolState::new(accounts)),
            tokens: RwLock::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
            token_source,
            store: None,
            debouncer: OnceLock::new(),
        }
    }

    /// Build the pool from configuration merged with the persisted document.
    ///
    /// An unreadable document is logged and ignored; the pool then starts
    /// from configuration alone.
    pub async fn load(
        store: Arc<JsonStore>,
        configured: Vec<Credential>,
        token_source: Arc<dyn TokenSource>,
    ) -> Self {
        let persisted = match store.read::<PoolDocument>(POOL_DOCUMENT).await {
            Ok(document) => document,
            Err(e) => {
                let err = common::Error::ConfigInvalid(e.to_string());
                warn!(error = %err, "ignoring persisted pool state, starting from configuration");
                None
            }
        };
        let restored = persisted.is_some();
        let state = merge(configured, persisted);
        info!(accounts = state.accounts.len(), restored, "pool initialized");

        Self {
            state: RwLock::new(state),
            tokens: RwLock::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
            token_source,
            store: Some(store),
            debouncer: OnceLock::new(),
        }
    }

    /// Start the debounced writer for the pool document.
    ///
    /// Mutations within `window` of each other coalesce into one write. The
    /// task holds only a weak reference, so it never keeps the pool alive.
    pub fn spawn_persistence(self: &Arc<Self>, window: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let (debouncer, handle) = spawn_debounced(window, move || {
            let weak = weak.clone();
            async move {
                if let Some(pool) = weak.upgrade()
                    && let Err(e) = pool.flush().await
                {
                    warn!(error = %e, "failed to persist pool state");
                }
            }
        });
        if self.debouncer.set(debouncer).is_err() {
            warn!("pool persistence already running");
        }
        handle
    }

    /// Write the pool document now. No-op for an in-memory pool.
    pub async fn flush(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let document = self.state.read().await.document();
        store.write(POOL_DOCUMENT, &document).await?;
        debug!(accounts = document.accounts.len(), "pool state persisted");
        Ok(())
    }

    fn mark_changed(&self) {
        if let Some(debouncer) = self.debouncer.get() {
            debouncer.mark_changed();
        }
    }

    /// Select an account per `strategy` and return it with a live token.
    ///
    /// Expired rate limits are cleared first. An account whose token cannot
    /// be obtained is skipped for the rest of this call (and deactivated if
    /// GitHub rejected its credentials). Fails with `PoolExhausted` when no
    /// eligible account is left.
    pub async fn select(&self, strategy: Strategy) -> Result<SelectedAccount> {
        let mut excluded: Vec<String> = Vec::new();
        loop {
            let (id, github_token) = {
                let mut state = self.state.write().await;
                let now = now_millis();
                state.clear_expired(now);
                let Some(idx) = state.pick(strategy, &excluded) else {
                    let counts = state.counts(now);
                    return Err(Error::PoolExhausted(format!(
                        "{} of {} accounts eligible ({} rate limited, {} paused, {} inactive)",
                        counts.eligible.saturating_sub(excluded.len()),
                        counts.total - counts.standby,
                        counts.rate_limited,
                        counts.paused,
                        counts.inactive
                    )));
                };
                let credential = &mut state.accounts[idx];
                credential.last_used = Some(now);
                (credential.id.clone(), credential.token.clone())
            };
            self.mark_changed();

            match self.live_token(&id, &github_token).await {
                Ok(access_token) => {
                    metrics::counter!("gateway_pool_selections_total", "account_id" => id.clone())
                        .increment(1);
                    debug!(account_id = %id, %strategy, "account selected");
                    return Ok(SelectedAccount {
                        id,
                        access_token: Secret::new(access_token),
                    });
                }
                Err(e) => {
                    warn!(account_id = %id, error = %e, "account has no usable token, trying next");
                    excluded.push(id);
                }
            }
        }
    }

    /// Cached Copilot token, refreshed inline when missing or inside the
    /// refresh margin. A failed refresh falls back to the old token while it
    /// has not actually expired.
    async fn live_token(&self, id: &str, github_token: &Secret<String>) -> Result<String> {
        let now = now_millis();
        let cached = self.tokens.read().await.get(id).cloned();
        if let Some(token) = &cached
            && !token.needs_refresh(now)
        {
            return Ok(token.token.clone());
        }

        debug!(account_id = id, "Copilot token missing or expiring, refreshing inline");
        match self.exchange_shared(id, github_token).await {
            Ok(token) => Ok(token.token),
            Err(e @ Error::Deactivated { .. }) => Err(e),
            Err(e) => match cached {
                Some(token) if now < token.expires_at_millis() => {
                    warn!(account_id = id, error = %e, "inline refresh failed, using current token until expiry");
                    Ok(token.token)
                }
                _ => Err(e),
            },
        }
    }

    /// Run at most one exchange per account at a time.
    ///
    /// Callers that queued behind an exchange reuse its outcome: a token that
    /// is now fresh, or the failure that happened while they waited.
    async fn exchange_shared(
        &self,
        id: &str,
        github_token: &Secret<String>,
    ) -> Result<CopilotToken> {
        let slot = self
            .exchanges
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone();
        let seen = slot.completed.load(Ordering::Acquire);
        let mut last_failure = slot.last_failure.lock().await;

        let fresh = self
            .tokens
            .read()
            .await
            .get(id)
            .filter(|t| !t.needs_refresh(now_millis()))
            .cloned();
        if let Some(token) = fresh {
            debug!(account_id = id, "token refreshed by a concurrent caller");
            return Ok(token);
        }
        if let Some(message) = last_failure.as_ref()
            && slot.completed.load(Ordering::Acquire) != seen
        {
            return Err(Error::RefreshFailed(message.clone()));
        }

        let result = self.exchange(id, github_token).await;
        *last_failure = result.as_ref().err().map(|e| e.to_string());
        slot.completed.fetch_add(1, Ordering::Release);
        result
    }

    async fn exchange(&self, id: &str, github_token: &Secret<String>) -> Result<CopilotToken> {
        match self.token_source.exchange(github_token.expose()).await {
            Ok(token) => {
                info!(account_id = id, expires_at = token.expires_at, "Copilot token refreshed");
                self.tokens
                    .write()
                    .await
                    .insert(id.to_string(), token.clone());
                Ok(token)
            }
            Err(copilot_auth::Error::InvalidCredentials(message)) => {
                self.deactivate(id, &message).await;
                Err(Error::Deactivated {
                    id: id.to_string(),
                    message,
                })
            }
            Err(e) => Err(Error::RefreshFailed(e.to_string())),
        }
    }

    /// Exchange the account's GitHub token for a fresh Copilot token, unless
    /// a concurrent caller already did.
    pub async fn refresh_upstream_token(&self, id: &str) -> Result<CopilotToken> {
        let github_token = {
            let state = self.state.read().await;
            let idx = state
                .index_of(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            state.accounts[idx].token.clone()
        };
        self.exchange_shared(id, &github_token).await
    }

    async fn update<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Credential),
    {
        {
            let mut state = self.state.write().await;
            let credential = state
                .accounts
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            f(credential);
            state.invalidate();
        }
        self.mark_changed();
        Ok(())
    }

    pub async fn report_success(&self, id: &str) {
        let now = now_millis();
        if let Err(e) = self
            .update(id, |c| {
                c.request_count += 1;
                c.last_used = Some(now);
            })
            .await
        {
            debug!(account_id = id, error = %e, "success report for unknown account");
        }
    }

    /// Bench an account until `reset_at` (unix millis).
    pub async fn report_rate_limited(&self, id: &str, reset_at: u64) {
        let result = self
            .update(id, |c| {
                c.rate_limited = true;
                c.rate_limit_reset_at = Some(reset_at);
            })
            .await;
        match result {
            Ok(()) => {
                metrics::counter!("gateway_pool_rate_limited_total").increment(1);
                info!(account_id = id, reset_at, "account rate limited");
            }
            Err(e) => debug!(account_id = id, error = %e, "rate-limit report for unknown account"),
        }
    }

    /// Record a failure. Does not change eligibility.
    pub async fn report_error(&self, id: &str, message: &str) {
        let message = message.to_string();
        if let Err(e) = self
            .update(id, |c| {
                c.error_count += 1;
                c.last_error = Some(message);
            })
            .await
        {
            debug!(account_id = id, error = %e, "error report for unknown account");
        }
    }

    /// Take an account out of rotation after an explicit auth failure.
    pub async fn deactivate(&self, id: &str, reason: &str) {
        let reason = reason.to_string();
        if self
            .update(id, |c| {
                c.active = false;
                c.error_count += 1;
                c.last_error = Some(reason);
            })
            .await
            .is_ok()
        {
            self.tokens.write().await.remove(id);
            warn!(account_id = id, "account deactivated (credentials rejected)");
        }
    }

    pub async fn add_account(&self, credential: Credential) -> Result<()> {
        let id = credential.id.clone();
        {
            let mut state = self.state.write().await;
            if state.index_of(&id).is_some() {
                return Err(Error::Duplicate(id));
            }
            state.accounts.push(credential);
            state.invalidate();
        }
        self.mark_changed();
        info!(account_id = %id, "account added to pool");
        Ok(())
    }

    /// Deferred removal: the account is marked inactive so in-flight
    /// requests holding its id can still report back.
    pub async fn remove_account(&self, id: &str) -> Result<()> {
        self.update(id, |c| c.active = false).await?;
        self.tokens.write().await.remove(id);
        info!(account_id = id, "account removed from rotation");
        Ok(())
    }

    /// Restrict selection to `ids` for the life of this process.
    ///
    /// Every other account is put on standby regardless of its flags. Standby
    /// is not persisted, so the stored document keeps the accounts exactly as
    /// they were. Returns the number of accounts put on standby.
    pub async fn hold_in_standby_except(&self, ids: &[String]) -> usize {
        let mut state = self.state.write().await;
        let mut held = 0;
        for credential in &mut state.accounts {
            credential.standby = !ids.contains(&credential.id);
            if credential.standby {
                held += 1;
                debug!(account_id = %credential.id, "account on standby");
            }
        }
        state.invalidate();
        held
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.update(id, |c| c.paused = true).await?;
        info!(account_id = id, "account paused");
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.update(id, |c| c.paused = false).await?;
        info!(account_id = id, "account resumed");
        Ok(())
    }

    /// Re-enable an inactive or standby account and clear any rate limit.
    pub async fn activate(&self, id: &str) -> Result<()> {
        self.update(id, |c| {
            c.active = true;
            c.standby = false;
            c.rate_limited = false;
            c.rate_limit_reset_at = None;
        })
        .await?;
        info!(account_id = id, "account activated");
        Ok(())
    }

    /// Per-account status for the admin API.
    pub async fn accounts_status(&self) -> Vec<AccountStatus> {
        let state = self.state.read().await;
        let tokens = self.tokens.read().await;
        state
            .accounts
            .iter()
            .map(|c| {
                AccountStatus::from_credential(c, tokens.get(&c.id).map(|t| t.expires_at_millis()))
            })
            .collect()
    }

    /// Pool health summary: all accounts eligible → healthy, some →
    /// degraded, none → unhealthy. Standby accounts do not count.
    pub async fn health(&self) -> serde_json::Value {
        let counts = self.state.read().await.counts(now_millis());
        let serving = counts.total - counts.standby;
        let status = if serving > 0 && counts.eligible == serving {
            "healthy"
        } else if counts.eligible > 0 {
            "degraded"
        } else {
            "unhealthy"
        };
        serde_json::json!({
            "status": status,
            "accounts_total": counts.total,
            "accounts_eligible": counts.eligible,
            "accounts_rate_limited": counts.rate_limited,
            "accounts_paused": counts.paused,
            "accounts_inactive": counts.inactive,
            "accounts_standby": counts.standby,
        })
    }

    /// Active accounts with the unix-millis time their token is due for
    /// refresh (`None` when no token has been obtained yet).
    pub async fn refresh_schedule(&self) -> Vec<(String, Option<u64>)> {
        let state = self.state.read().await;
        let tokens = self.tokens.read().await;
        state
            .accounts
            .iter()
            .filter(|c| c.active && !c.standby)
            .map(|c| (c.id.clone(), tokens.get(&c.id).map(|t| t.refresh_due_at())))
            .collect()
    }
}
