//! Proactive background token refresh
//!
//! Copilot tokens live for roughly 25 minutes. The background task sleeps
//! until the earliest account is due (`expires_at - 60s`), refreshes every
//! due account, and goes back to sleep. Request-time refresh in
//! `Pool::select` covers whatever this task misses.
//!
//! An account whose refresh keeps giving up is retried on a doubling
//! interval instead of every cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::now_millis;
use copilot_auth::CopilotToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::pool::Pool;

/// Extra attempts after the first failed refresh.
pub const REFRESH_RETRIES: u32 = 3;

/// Linear backoff step: retry `n` waits `n * REFRESH_RETRY_STEP`.
pub const REFRESH_RETRY_STEP: Duration = Duration::from_secs(5);

/// Longest the task sleeps when nothing is due sooner.
const IDLE_INTERVAL: Duration = Duration::from_secs(300);

/// Shortest sleep between cycles, so an account that keeps failing is not
/// hammered.
const MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Wait after the first give-up; doubles on each consecutive one.
const FAILURE_BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Cap on the give-up backoff.
const FAILURE_BACKOFF_MAX: Duration = Duration::from_secs(30 * 60);

/// Refresh one account's Copilot token, retrying transient failures.
///
/// On give-up the previous token stays in place until it actually expires.
/// Returns `None` when no new token was obtained.
pub async fn refresh_with_retry(pool: &Pool, account_id: &str) -> Option<CopilotToken> {
    for attempt in 0..=REFRESH_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(REFRESH_RETRY_STEP * attempt).await;
        }
        match pool.refresh_upstream_token(account_id).await {
            Ok(token) => return Some(token),
            Err(e @ (Error::Deactivated { .. } | Error::NotFound(_))) => {
                warn!(account_id, error = %e, "refresh abandoned");
                return None;
            }
            Err(e) => {
                warn!(
                    account_id,
                    attempt = attempt + 1,
                    max_attempts = REFRESH_RETRIES + 1,
                    error = %e,
                    "token refresh failed"
                );
            }
        }
    }
    error!(account_id, "token refresh gave up, keeping current token (degraded)");
    None
}

/// Consecutive give-ups per account and the unix millis before which the
/// account is not retried.
#[derive(Debug, Default)]
struct FailureBackoff {
    accounts: HashMap<String, (u32, u64)>,
}

impl FailureBackoff {
    /// Record a give-up and return how long the account now waits.
    fn record_failure(&mut self, id: &str, now_ms: u64) -> Duration {
        let entry = self.accounts.entry(id.to_string()).or_insert((0, now_ms));
        let wait = FAILURE_BACKOFF_BASE
            .saturating_mul(1u32 << entry.0.min(16))
            .min(FAILURE_BACKOFF_MAX);
        entry.0 += 1;
        entry.1 = now_ms + wait.as_millis() as u64;
        wait
    }

    fn clear(&mut self, id: &str) {
        self.accounts.remove(id);
    }

    /// Push each backed-off account's due time out to the end of its wait.
    /// Entries for accounts no longer scheduled are dropped.
    fn apply(&mut self, schedule: Vec<(String, Option<u64>)>) -> Vec<(String, Option<u64>)> {
        self.accounts
            .retain(|id, _| schedule.iter().any(|(scheduled, _)| scheduled == id));
        schedule
            .into_iter()
            .map(|(id, at)| match self.accounts.get(&id) {
                Some(&(_, until)) => {
                    let at = Some(at.map_or(until, |at| at.max(until)));
                    (id, at)
                }
                None => (id, at),
            })
            .collect()
    }
}

/// Spawn the background refresh loop.
pub fn spawn_refresh_task(pool: Arc<Pool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = FailureBackoff::default();
        loop {
            let schedule = backoff.apply(pool.refresh_schedule().await);
            let now = now_millis();

            let due: Vec<String> = schedule
                .iter()
                .filter(|(_, at)| at.is_none_or(|at| at <= now))
                .map(|(id, _)| id.clone())
                .collect();

            for id in &due {
                debug!(account_id = %id, "token due, refreshing");
                if refresh_with_retry(&pool, id).await.is_some() {
                    backoff.clear(id);
                    info!(account_id = %id, "background token refresh succeeded");
                } else {
                    let wait = backoff.record_failure(id, now_millis());
                    warn!(account_id = %id, retry_in_secs = wait.as_secs(), "backing off token refresh");
                }
            }

            let schedule = backoff.apply(pool.refresh_schedule().await);
            let sleep = next_sleep(&schedule, now_millis());
            debug!(sleep_secs = sleep.as_secs(), "refresh task sleeping");
            tokio::time::sleep(sleep).await;
        }
    })
}

/// Time until the earliest scheduled refresh, clamped to
/// `[MIN_INTERVAL, IDLE_INTERVAL]`.
fn next_sleep(schedule: &[(String, Option<u64>)], now_ms: u64) -> Duration {
    schedule
        .iter()
        .map(|(_, at)| at.unwrap_or(now_ms).saturating_sub(now_ms))
        .min()
        .map(Duration::from_millis)
        .unwrap_or(IDLE_INTERVAL)
        .clamp(MIN_INTERVAL, IDLE_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use common::Secret;
    use copilot_auth::TokenSource;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` exchanges, then succeeds. A failure count
    /// of `u32::MAX` means "revoked".
    struct ScriptedSource {
        calls: AtomicU32,
        failures: u32,
    }

    impl ScriptedSource {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
            })
        }
    }

    impl TokenSource for ScriptedSource {
        fn exchange<'a>(
            &'a self,
            _github_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = copilot_auth::Result<CopilotToken>> + Send + 'a>>
        {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let failures = self.failures;
            Box::pin(async move {
                if failures == u32::MAX {
                    return Err(copilot_auth::Error::InvalidCredentials("revoked".into()));
                }
                if call < failures {
                    return Err(copilot_auth::Error::Http("timeout".into()));
                }
                Ok(CopilotToken {
                    token: format!("cop_{call}"),
                    expires_at: now_millis() / 1000 + 1500,
                    refresh_in: 1440,
                })
            })
        }
    }

    fn pool_with(source: Arc<ScriptedSource>) -> Pool {
        Pool::new(
            vec![Credential::new("a", Secret::new("gho_a".into()), None)],
            source,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let source = ScriptedSource::new(2);
        let pool = pool_with(source.clone());

        let token = refresh_with_retry(&pool, "a").await.unwrap();
        assert_eq!(token.token, "cop_2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_retries_with_linear_backoff() {
        let source = ScriptedSource::new(100);
        let pool = pool_with(source.clone());
        let start = tokio::time::Instant::now();

        assert!(refresh_with_retry(&pool, "a").await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        // 5s + 10s + 15s
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(pool.accounts_status().await[0].status, "active");
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_token_stops_immediately() {
        let source = ScriptedSource::new(u32::MAX);
        let pool = pool_with(source.clone());

        assert!(refresh_with_retry(&pool, "a").await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.accounts_status().await[0].status, "inactive");
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_warms_missing_tokens() {
        let source = ScriptedSource::new(0);
        let pool = Arc::new(pool_with(source.clone()));
        let handle = spawn_refresh_task(pool.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(pool.accounts_status().await[0].token_expires_at.is_some());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_account_is_not_retried_every_cycle() {
        let source = ScriptedSource::new(u32::MAX - 1);
        let pool = Arc::new(pool_with(source.clone()));
        let handle = spawn_refresh_task(pool.clone());

        // One give-up cycle, then the account waits out its backoff.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), REFRESH_RETRIES + 1);
        handle.abort();
    }

    #[test]
    fn failure_backoff_doubles_and_caps() {
        let mut backoff = FailureBackoff::default();
        let waits: Vec<u64> = (0..8)
            .map(|_| backoff.record_failure("a", 0).as_secs())
            .collect();
        assert_eq!(waits, [30, 60, 120, 240, 480, 960, 1800, 1800]);

        backoff.clear("a");
        assert_eq!(backoff.record_failure("a", 0), FAILURE_BACKOFF_BASE);
    }

    #[test]
    fn failure_backoff_delays_due_time() {
        let now = 1_000_000;
        let mut backoff = FailureBackoff::default();
        backoff.record_failure("a", now);

        let schedule = backoff.apply(vec![
            ("a".to_string(), None),
            ("b".to_string(), Some(now)),
        ]);
        assert_eq!(schedule[0].1, Some(now + 30_000));
        assert_eq!(schedule[1].1, Some(now));

        // Accounts that left the schedule are forgotten.
        backoff.apply(vec![("b".to_string(), Some(now))]);
        assert!(backoff.accounts.is_empty());
    }

    #[test]
    fn next_sleep_targets_earliest_due_account() {
        let now = 1_000_000;
        let schedule = vec![
            ("a".to_string(), Some(now + 120_000)),
            ("b".to_string(), Some(now + 60_000)),
        ];
        assert_eq!(next_sleep(&schedule, now), Duration::from_secs(60));
    }

    #[test]
    fn next_sleep_is_clamped() {
        let now = 1_000_000;
        assert_eq!(next_sleep(&[], now), IDLE_INTERVAL);
        assert_eq!(
            next_sleep(&[("a".into(), Some(now + 3_600_000))], now),
            IDLE_INTERVAL
        );
        assert_eq!(next_sleep(&[("a".into(), None)], now), MIN_INTERVAL);
    }
}
