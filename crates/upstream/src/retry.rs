//! Resilient invoker: retry with exponential backoff plus request pacing
//!
//! `Invoker::invoke` runs one closure per attempt. Failures the policy deems
//! retryable (transport errors, listed HTTP statuses) are retried after a
//! jittered exponential delay; anything else returns immediately. The
//! optional `RateGate` enforces a minimum spacing between attempts for a
//! single shared credential, independent of the pool's rate-limit flags.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Result, UpstreamError};

/// Called before each backoff sleep with (failed attempt, its error, delay).
pub type AttemptCallback = Arc<dyn Fn(u32, &UpstreamError, Duration) + Send + Sync>;

pub const DEFAULT_RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Jitter spread applied symmetrically around the computed delay.
const JITTER: f64 = 0.2;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. 1 = no retry.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retryable_statuses: Vec<u16>,
    pub jitter: bool,
    pub on_attempt: Option<AttemptCallback>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            jitter: true,
            on_attempt: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("retryable_statuses", &self.retryable_statuses)
            .field("jitter", &self.jitter)
            .field("on_attempt", &self.on_attempt.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-indexed), before jitter:
    /// `min(max_delay, initial_delay * multiplier^(attempt-1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if secs.is_finite() {
            Duration::from_secs_f64(secs.clamp(0.0, cap))
        } else {
            self.max_delay
        }
    }

    /// Base delay with ±20% uniform jitter, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - JITTER)..=(1.0 + JITTER));
        base.mul_f64(factor).min(self.max_delay)
    }
}

/// Minimum spacing between consecutive upstream attempts.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    wait: bool,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration, wait: bool) -> Self {
        Self {
            min_interval,
            wait,
            last: Mutex::new(None),
        }
    }

    /// Admit one attempt, sleeping out the remaining interval when waiting
    /// is enabled or failing with `RateLimitExceeded` when it is not.
    ///
    /// The lock is held across the sleep so concurrent waiters are admitted
    /// one interval apart.
    pub async fn acquire(&self) -> Result<()> {
        if self.min_interval.is_zero() {
            return Ok(());
        }
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let remaining = self.min_interval - elapsed;
                if !self.wait {
                    return Err(UpstreamError::RateLimitExceeded {
                        retry_after: remaining,
                    });
                }
                debug!(wait_ms = remaining.as_millis() as u64, "pacing upstream request");
                tokio::time::sleep(remaining).await;
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

/// Runs upstream attempts under a `RetryPolicy` and optional `RateGate`.
#[derive(Debug)]
pub struct Invoker {
    policy: RetryPolicy,
    gate: Option<RateGate>,
}

impl Invoker {
    pub fn new(policy: RetryPolicy, gate: Option<RateGate>) -> Self {
        Self { policy, gate }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `f` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// `f` receives the 1-indexed attempt number. On exhaustion the last
    /// error is returned unchanged.
    pub async fn invoke<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if let Some(gate) = &self.gate {
                gate.acquire().await?;
            }
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e)
                    if attempt < max_attempts
                        && e.is_retryable(&self.policy.retryable_statuses) =>
                {
                    let delay = self.policy.delay_for_attempt(attempt);
                    if let Some(callback) = &self.policy.on_attempt {
                        callback(attempt, &e, delay);
                    }
                    metrics::counter!("gateway_retries_total").increment(1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
