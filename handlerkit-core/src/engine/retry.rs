//! Retry policy and backoff
//!
//! Only retryable error kinds (`Timeout`, `Network`) are retried. The
//! default curve is linear: 100ms, 200ms, 300ms ... capped at 5s.

use crate::handler::HandlerError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Shape of the delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    Constant,
    /// Delay grows by `initial_delay` per retry
    Linear,
    /// Delay multiplies by `multiplier` per retry
    Exponential { multiplier: f64 },
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,

    /// Delay before the first retry, and the linear step
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Linear,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Allow `retries` additional attempts after the first
    pub fn with_retries(retries: u32) -> Self {
        Self::default().with_max_attempts(retries.saturating_add(1))
    }

    /// Builder: set max attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Builder: set max delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Builder: set the backoff curve
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before retry number `retry` (1 for the first retry)
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let base = self.initial_delay.as_millis() as f64;

        let delay = match self.backoff {
            Backoff::Constant => base,
            Backoff::Linear => base * retry as f64,
            Backoff::Exponential { multiplier } => {
                base * multiplier.max(1.0).powi(retry.saturating_sub(1) as i32)
            }
        };

        let clamped = delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(clamped as u64)
    }

    /// Sum of every pause the policy can insert between its attempts
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|retry| self.delay_for_attempt(retry))
            .sum()
    }

    /// Whether another attempt may follow `attempts_made` failed attempts
    pub fn should_retry(&self, attempts_made: u32, error: &HandlerError) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts.max(1)
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, HandlerError>,
    /// Attempts actually made (1-based)
    pub attempts: u32,
}

/// Execute an async operation under a retry policy
///
/// The operation receives the 1-based attempt number. Non-retryable errors
/// are returned immediately.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HandlerError>>,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(error) => {
                if !policy.should_retry(attempt, &error) {
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                    };
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after retryable failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff, Backoff::Linear);
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_and_constant_delay() {
        let exponential = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(50))
            .with_backoff(Backoff::Exponential { multiplier: 2.0 });

        assert_eq!(exponential.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(exponential.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(exponential.delay_for_attempt(3), Duration::from_millis(200));

        let constant = RetryPolicy::default().with_backoff(Backoff::Constant);
        assert_eq!(constant.delay_for_attempt(7), Duration::from_millis(100));
    }

    #[test]
    fn test_total_delay_sums_pauses_between_attempts() {
        assert_eq!(RetryPolicy::no_retry().total_delay(), Duration::ZERO);
        assert_eq!(
            RetryPolicy::with_retries(4).total_delay(),
            Duration::from_millis(100 + 200 + 300 + 400)
        );
    }

    #[test]
    fn test_with_retries_counts_first_attempt() {
        assert_eq!(RetryPolicy::with_retries(0).max_attempts, 1);
        assert_eq!(RetryPolicy::with_retries(2).max_attempts, 3);
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(2);

        let outcome = with_retry(&policy, move |_| async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(HandlerError::network("connection refused"))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_semantic_failure_not_retried() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(5);

        let outcome: RetryOutcome<()> = with_retry(&policy, move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::execution("bad input"))
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
