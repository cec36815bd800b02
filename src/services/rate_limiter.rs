//! Adaptive delay controller shared by every batch a process submits.
//!
//! The delay shrinks geometrically while batches succeed and grows when a
//! batch fails outright, which is the platform's throttling signal.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// Suspension point for rate-limit and backoff delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that returns immediately and records every requested delay.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.recorded().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterSettings {
    pub initial_delay_secs: f64,
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    pub increase_factor: f64,
    pub decrease_factor: f64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: 2.0,
            min_delay_secs: 1.0,
            max_delay_secs: 30.0,
            increase_factor: 2.0,
            decrease_factor: 0.98,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct LimiterStats {
    pub current_delay_secs: f64,
    pub successes: u64,
    pub errors: u64,
}

#[derive(Debug)]
struct LimiterState {
    delay_secs: f64,
    successes: u64,
    errors: u64,
}

pub struct AdaptiveRateLimiter {
    settings: RateLimiterSettings,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(settings: RateLimiterSettings) -> Self {
        let initial = settings
            .initial_delay_secs
            .clamp(settings.min_delay_secs, settings.max_delay_secs);
        metrics::gauge!("rate_limiter_delay_seconds").set(initial);
        Self {
            settings,
            state: Mutex::new(LimiterState {
                delay_secs: initial,
                successes: 0,
                errors: 0,
            }),
        }
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_secs_f64(self.stats().current_delay_secs)
    }

    pub fn stats(&self) -> LimiterStats {
        match self.state.lock() {
            Ok(state) => LimiterStats {
                current_delay_secs: state.delay_secs,
                successes: state.successes,
                errors: state.errors,
            },
            Err(poisoned) => {
                let state = poisoned.into_inner();
                LimiterStats {
                    current_delay_secs: state.delay_secs,
                    successes: state.successes,
                    errors: state.errors,
                }
            }
        }
    }

    /// A batch went through (fully or partially): shrink the delay.
    pub fn on_success(&self) {
        let min = self.settings.min_delay_secs;
        let factor = self.settings.decrease_factor;
        self.adjust(|state| {
            state.successes += 1;
            state.delay_secs = (state.delay_secs * factor).max(min);
        });
    }

    /// Every operation in a batch failed: back off harder.
    pub fn on_error(&self) {
        let max = self.settings.max_delay_secs;
        let factor = self.settings.increase_factor;
        let delay = self.adjust(|state| {
            state.errors += 1;
            state.delay_secs = (state.delay_secs * factor).min(max);
        });
        tracing::warn!(delay_ms = (delay * 1000.0) as u64, "Rate limiter delay increased");
    }

    fn adjust(&self, update: impl FnOnce(&mut LimiterState)) -> f64 {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut guard);
        metrics::gauge!("rate_limiter_delay_seconds").set(guard.delay_secs);
        guard.delay_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifty_successes_clamp_to_min() {
        let limiter = AdaptiveRateLimiter::new(RateLimiterSettings::default());
        for _ in 0..50 {
            limiter.on_success();
        }
        let stats = limiter.stats();
        assert_eq!(stats.current_delay_secs, 1.0);
        assert_eq!(stats.successes, 50);
        assert_eq!(limiter.current_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_errors_grow_delay_up_to_max() {
        let limiter = AdaptiveRateLimiter::new(RateLimiterSettings::default());
        limiter.on_error();
        assert_eq!(limiter.stats().current_delay_secs, 4.0);
        for _ in 0..10 {
            limiter.on_error();
        }
        assert_eq!(limiter.stats().current_delay_secs, 30.0);
        assert_eq!(limiter.stats().errors, 11);
    }

    #[test]
    fn test_single_success_decreases_geometrically() {
        let limiter = AdaptiveRateLimiter::new(RateLimiterSettings::default());
        limiter.on_success();
        assert!((limiter.stats().current_delay_secs - 1.96).abs() < 1e-12);
    }

    #[test]
    fn test_initial_delay_is_clamped_into_range() {
        let limiter = AdaptiveRateLimiter::new(RateLimiterSettings {
            initial_delay_secs: 100.0,
            ..Default::default()
        });
        assert_eq!(limiter.stats().current_delay_secs, 30.0);
    }

    #[tokio::test]
    async fn test_recording_sleeper_records_without_waiting() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_secs(60)).await;
        sleeper.sleep(Duration::from_secs(2)).await;
        assert_eq!(sleeper.recorded().len(), 2);
        assert_eq!(sleeper.total(), Duration::from_secs(62));
    }
}
