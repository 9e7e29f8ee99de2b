pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerOpen, CircuitBreaker, CircuitState};
pub use retry::{RetryPolicy, Retryable};

use std::{fmt::Display, future::Future};

/// Applies `breaker(retry(call))`, or just `retry(call)` when no breaker
/// guards the endpoint. The breaker sees one outcome per retried sequence.
#[derive(Debug, Clone)]
pub struct CallExecutor {
    retry: RetryPolicy,
    breaker: Option<CircuitBreaker>,
}

impl CallExecutor {
    pub fn new(retry: RetryPolicy, breaker: Option<CircuitBreaker>) -> Self {
        Self { retry, breaker }
    }

    #[cfg(test)]
    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub async fn execute<T, E, F, Fut>(&self, operation: &str, call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + From<BreakerOpen> + Display,
    {
        match &self.breaker {
            Some(breaker) => {
                breaker
                    .call(|| self.retry.execute(operation, call))
                    .await
            }
            None => self.retry.execute(operation, call).await,
        }
    }
}
