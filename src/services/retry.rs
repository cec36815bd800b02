//! Retry policy table keyed by [`ErrorKind`].
//!
//! Throttling backs off for minutes, transient failures for seconds, and
//! everything else is returned to the caller on the first failure.

use std::future::Future;
use std::time::Duration;

use crate::services::ads_api::{ApiError, ErrorKind};
use crate::services::rate_limiter::Sleeper;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_delay_secs: f64,
    pub factor: f64,
}

impl Backoff {
    /// Delay after the `attempt`-th failure (1-based): `base × factor^(attempt−1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        Duration::from_secs_f64(self.base_delay_secs * self.factor.powi(exponent))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub rate_limited: Backoff,
    pub transient: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limited: Backoff {
                base_delay_secs: 60.0,
                factor: 3.0,
            },
            transient: Backoff {
                base_delay_secs: 2.0,
                factor: 2.0,
            },
        }
    }
}

impl RetryPolicy {
    /// How long to wait before the next attempt, or `None` to give up.
    pub fn next_delay(&self, kind: ErrorKind, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match kind {
            ErrorKind::RateLimited => Some(self.rate_limited.delay(attempt)),
            ErrorKind::Transient => Some(self.transient.delay(attempt)),
            ErrorKind::RequestTooLarge | ErrorKind::Rejected | ErrorKind::Fatal => None,
        }
    }
}

/// Run `operation` until it succeeds or the policy gives up.
pub async fn call_with_retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = operation_name, attempt, "Remote call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let Some(delay) = policy.next_delay(err.kind, attempt) else {
                    if err.kind == ErrorKind::Fatal {
                        tracing::error!(operation = operation_name, error = %err, "Non-retryable remote error");
                    }
                    return Err(err);
                };

                metrics::counter!("remote_retries_total", "kind" => err.kind.to_string()).increment(1);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Remote call failed, retrying"
                );
                sleeper.sleep(delay).await;
            }
        }
    }
}
