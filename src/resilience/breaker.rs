//! Per-category circuit breaker.
//!
//! ```text
//! Closed   -> Open      error_count >= failure_threshold and error rate >= error_rate_threshold
//! Open     -> HalfOpen  recovery_timeout elapsed since the last tracked error
//! HalfOpen -> Closed    a trial call succeeds (counters reset)
//! HalfOpen -> Open      a trial call fails (last error time refreshed)
//! ```
//!
//! Rejections while open never touch the counters.

use super::retry::Retryable;
use crate::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Minimum tracked failures before the error rate is considered.
    pub failure_threshold: u32,
    pub error_rate_threshold: f64,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_rate_threshold: 0.5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Returned instead of running the call while the breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker `{name}` is open; call rejected")]
pub struct BreakerOpen {
    pub name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub call_count: u64,
    pub error_count: u64,
    pub rejected_count: u64,
    pub last_error_time: Option<Instant>,
    pub last_state_change: Instant,
}

impl BreakerSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.call_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.call_count as f64
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<BreakerConfig>,
    inner: Arc<Mutex<BreakerSnapshot>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerSnapshot {
                state: CircuitState::Closed,
                call_count: 0,
                error_count: 0,
                rejected_count: 0,
                last_error_time: None,
                last_state_change: Instant::now(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state; an open breaker whose recovery window has elapsed
    /// reports (and becomes) half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        *inner
    }

    /// Admits a call or rejects it without touching the error budget.
    pub fn try_acquire(&self) -> Result<(), BreakerOpen> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        if inner.state == CircuitState::Open {
            inner.rejected_count += 1;
            return Err(BreakerOpen {
                name: self.name.to_string(),
            });
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.call_count = 0;
            inner.error_count = 0;
            self.transition(&mut inner, CircuitState::Closed);
            info!(target: "cleanup.resilience", breaker = %self.name, "trial call succeeded, circuit closed");
            return;
        }
        inner.call_count += 1;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.call_count += 1;
        inner.error_count += 1;
        inner.last_error_time = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                warn!(target: "cleanup.resilience", breaker = %self.name, "trial call failed, circuit open again");
            }
            CircuitState::Closed => {
                let rate = inner.error_count as f64 / inner.call_count as f64;
                if inner.error_count >= u64::from(self.config.failure_threshold)
                    && rate >= self.config.error_rate_threshold
                {
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        target: "cleanup.resilience",
                        breaker = %self.name,
                        error_rate_pct = rate * 100.0,
                        errors = inner.error_count,
                        calls = inner.call_count,
                        "circuit opened",
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    #[cfg(test)]
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.call_count = 0;
        inner.error_count = 0;
        inner.rejected_count = 0;
        inner.last_error_time = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Runs `call` under the breaker. Failures outside the retryable family
    /// are accounted as successes.
    pub async fn call<T, E, F, Fut>(&self, call: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + From<BreakerOpen>,
    {
        self.try_acquire().map_err(E::from)?;
        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) if err.is_retryable() => {
                self.record_failure();
                Err(err)
            }
            Err(err) => {
                self.record_success();
                Err(err)
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerSnapshot) {
        if inner.state != CircuitState::Open {
            return;
        }
        let since = inner
            .last_error_time
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        if since >= self.config.recovery_timeout {
            self.transition(inner, CircuitState::HalfOpen);
            info!(target: "cleanup.resilience", breaker = %self.name, "recovery window elapsed, circuit half-open");
        }
    }

    fn transition(&self, inner: &mut BreakerSnapshot, to: CircuitState) {
        if inner.state != to {
            metrics::breaker_transition(&self.name, inner.state, to);
        }
        inner.state = to;
        inner.last_state_change = Instant::now();
    }
}
