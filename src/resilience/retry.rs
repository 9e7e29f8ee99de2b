use crate::metrics;
use rand::Rng;
use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{error, warn};

/// Errors that the retry loop and the circuit breaker know how to classify.
///
/// `is_retryable` marks the transport/HTTP failure family: those are retried
/// here and counted as tracked failures by [`super::CircuitBreaker`]. Anything
/// else propagates on the first attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Exponential backoff with optional jitter.
///
/// Attempt `i` (0-indexed) waits `min(base_delay * backoff_factor^i, max_delay)`,
/// scaled by a uniform factor in `[0.5, 1.0)` when `jitter` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first call.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let scaled = if self.jitter {
            capped * rand::rng().random_range(0.5..1.0)
        } else {
            capped
        };
        Duration::try_from_secs_f64(scaled).unwrap_or(self.max_delay)
    }

    pub async fn execute<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.max_retries => {
                    error!(
                        target: "cleanup.resilience",
                        operation,
                        attempts = attempt + 1,
                        error = %err,
                        "all attempts failed",
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        target: "cleanup.resilience",
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "call failed, retrying",
                    );
                    metrics::retry_scheduled(operation, attempt + 1);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::test_support::TestError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let p = policy(5);
        assert_eq!(p.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(400), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..200 {
            let delay = p.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(1), "{delay:?}");
            assert!(delay < Duration::from_secs(2), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = policy(3)
            .execute("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError::Transport)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries_plus_one() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(2)
            .execute("down", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Transport) }
            })
            .await;
        assert_eq!(result, Err(TestError::Transport));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(4)
            .execute("bad_input", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            })
            .await;
        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(0)
            .execute("once", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Transport) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
