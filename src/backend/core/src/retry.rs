//! Retry policy and backoff strategies for transient failures.
//!
//! Used by the consumer runtime (handler retries before dead-lettering) and
//! by the publisher (bus retries on `TransientBusError`).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Result, TaskflowError};

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Linear increase in delay (initial + increment * attempt)
    Linear { initial_delay_ms: u64, increment_ms: u64 },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Exponential with random jitter
    ExponentialWithJitter {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::ExponentialWithJitter {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Linear {
                initial_delay_ms,
                increment_ms,
            } => initial_delay_ms.saturating_add(increment_ms.saturating_mul(attempt as u64)),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                delay.min(*max_delay_ms as f64) as u64
            }
            Self::ExponentialWithJitter {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
                jitter_factor,
            } => {
                let base_delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                let capped_delay = base_delay.min(*max_delay_ms as f64);
                // delay * (1 +/- jitter_factor * random)
                let jitter_range = capped_delay * jitter_factor;
                let jitter = if jitter_range > 0.0 {
                    rand::rng().random_range(-jitter_range..=jitter_range)
                } else {
                    0.0
                };
                (capped_delay + jitter).max(1.0) as u64
            }
        };

        Duration::from_millis(millis)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded retry behavior for retryable errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff strategy for calculating delays
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Maximum total time spent retrying one operation
    #[serde(default, with = "humantime_serde")]
    pub max_retry_duration: Option<Duration>,
}

fn default_max_retries() -> u32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffStrategy::default(),
            max_retry_duration: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// A policy with fixed, short delays (tests and local runs).
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Fixed { delay_ms: 1 },
            max_retry_duration: None,
        }
    }

    /// Check if another retry should be attempted after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32, error: &TaskflowError, started_at: Instant) -> bool {
        if retries_done >= self.max_retries || !error.is_retryable() {
            return false;
        }

        if let Some(max_duration) = self.max_retry_duration {
            if started_at.elapsed() >= max_duration {
                return false;
            }
        }

        true
    }

    /// Get the delay before the next retry.
    pub fn next_retry_delay(&self, retries_done: u32) -> Duration {
        self.backoff.delay_for_attempt(retries_done)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the policy is exhausted.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started_at = Instant::now();
        let mut retries = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(retries, &error, started_at) => {
                    let delay = self.next_retry_delay(retries);
                    tracing::warn!(
                        operation = %operation,
                        retry = retries + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        code = %error.code(),
                        "Retrying after transient failure"
                    );
                    retries += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error.with_context("retries", retries)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = BackoffStrategy::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = BackoffStrategy::ExponentialWithJitter {
            initial_delay_ms: 1000,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter_factor: 0.2,
        };
        for attempt in 0..20 {
            let delay = backoff.delay_for_attempt(attempt).as_millis();
            assert!((800..=1200).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_should_retry_only_retryable_errors() {
        let policy = RetryPolicy::immediate(3);
        let now = Instant::now();
        assert!(policy.should_retry(0, &TaskflowError::transient_bus("down"), now));
        assert!(!policy.should_retry(3, &TaskflowError::transient_bus("down"), now));
        assert!(!policy.should_retry(0, &TaskflowError::malformed_envelope("bad"), now));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let value = RetryPolicy::immediate(3)
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskflowError::transient_bus("not yet"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::immediate(2)
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TaskflowError::transient_bus("still down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransientBusError);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_fatal_errors() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::immediate(5)
            .run("fatal", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TaskflowError::fatal_bus("too large"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FatalBusError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
