//! Bounded exponential backoff around a whole pipeline run.
//!
//! The policy is a plain combinator: it re-invokes an operation while a
//! classifier says the error is retriable. It knows nothing about stages;
//! resumption comes from the runner skipping checkpointed stages on each
//! new attempt.

use crate::models::{secs_to_duration, CrewError, RetryConfig};
use crate::pipeline::CancelToken;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and return the error
    Abort,
    /// Back off and try again, optionally no sooner than `hint`
    Retry { hint: Option<Duration> },
}

impl RetryDecision {
    /// Retry only rate limits, honoring the provider's retry hint.
    pub fn on_rate_limit(error: &CrewError) -> Self {
        if error.is_rate_limited() {
            Self::Retry {
                hint: error.retry_after(),
            }
        } else {
            Self::Abort
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub min_wait: Duration,
    /// Cap on any single delay
    pub max_wait: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Sleep before every attempt
    pub pacing_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            min_wait: secs_to_duration(config.min_wait_secs),
            max_wait: secs_to_duration(config.max_wait_secs),
            multiplier: config.multiplier.max(1.0),
            pacing_delay: secs_to_duration(config.pacing_delay_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based):
    /// `min(max_wait, min_wait * multiplier^(attempt-1))`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.min_wait.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_wait.as_secs_f64() {
            return self.max_wait;
        }
        Duration::from_secs_f64(secs)
    }

    /// Backoff raised to the provider hint, still capped by `max_wait`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = self.backoff(attempt);
        match hint {
            Some(hint) => delay.max(hint).min(self.max_wait),
            None => delay,
        }
    }

    /// Run `op` until it succeeds, `classify` aborts, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned
    /// unchanged. A cancelled `cancel` token cuts any sleep short; the next
    /// attempt is expected to observe the token and fail fast.
    pub async fn retry<T, E, F, Fut, C>(&self, cancel: &CancelToken, classify: C, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDecision,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            sleep_unless_cancelled(self.pacing_delay, cancel).await;

            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let hint = match classify(&error) {
                RetryDecision::Abort => {
                    debug!(attempt, error = %error, "Error is not retriable");
                    return Err(error);
                }
                RetryDecision::Retry { hint } => hint,
            };

            if attempt >= self.max_attempts {
                warn!(
                    attempts = attempt,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return Err(error);
            }

            let delay = self.delay_for(attempt, hint);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_secs = delay.as_secs_f64(),
                error = %error,
                "Rate limited, backing off before retry"
            );
            sleep_unless_cancelled(delay, cancel).await;
            attempt += 1;
        }
    }
}

async fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) {
    if delay.is_zero() || cancel.is_cancelled() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => {
            debug!("Backoff interrupted by cancellation");
        }
    }
}
