//! Closed/Open/Half-Open circuit breaker gating calls to a single failing
//! callee.
//!
//! Uses a plain threshold/reset-timeout/success-threshold model rather than
//! a rolling window of recent calls.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ContentEngineError, Result};

#[derive(Clone, Copy, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RawState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

struct Inner {
    raw: RawState,
    consecutive_failures: u32,
    half_open_successes: u32,
}

/// One breaker instance guards calls to a single model/callee.
pub struct CircuitBreaker {
    label: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("label", &self.label).finish()
    }
}

/// Snapshot attached to a `CircuitOpen` error for operator visibility.
#[derive(Clone, Debug)]
pub struct CircuitStats {
    pub consecutive_failures: u32,
    pub opened_for: Duration,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            label: label.into(),
            config,
            inner: Mutex::new(Inner {
                raw: RawState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Transitions Open -> HalfOpen when `reset_timeout` has elapsed, then
    /// reports whether a call may proceed right now.
    async fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.raw {
            RawState::Closed | RawState::HalfOpen => Ok(()),
            RawState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    inner.raw = RawState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(ContentEngineError::CircuitOpen {
                        model: self.label.clone(),
                        failures: inner.consecutive_failures,
                    })
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.raw {
            RawState::Closed => {
                inner.consecutive_failures = 0;
            }
            RawState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.raw = RawState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                }
            }
            RawState::Open { .. } => {}
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.raw {
            RawState::HalfOpen => {
                inner.raw = RawState::Open { opened_at: Instant::now() };
                inner.half_open_successes = 0;
            }
            RawState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.raw = RawState::Open { opened_at: Instant::now() };
                }
            }
            RawState::Open { .. } => {}
        }
    }

    /// Runs `f` if the breaker currently admits calls, recording the outcome.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.admit().await?;
        match f().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(err)
            }
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.raw = RawState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
    }

    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().await;
        CircuitStats {
            consecutive_failures: inner.consecutive_failures,
            opened_for: match inner.raw {
                RawState::Open { opened_at } => opened_at.elapsed(),
                _ => Duration::ZERO,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            success_threshold: 2,
        }
    }

    async fn fail() -> Result<()> {
        Err(ContentEngineError::Network("boom".into()))
    }

    async fn ok() -> Result<()> {
        Ok(())
    }

    #[tokio::test]
    async fn opens_after_failure_threshold_then_fast_fails() {
        let breaker = CircuitBreaker::new("model-a", config());
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        let err = breaker.call(ok).await.unwrap_err();
        assert!(matches!(err, ContentEngineError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("model-a", config());
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        tokio::time::advance(Duration::from_millis(60)).await;
        breaker.call(ok).await.unwrap();
        breaker.call(ok).await.unwrap();
        // Third call should no longer fast-fail: breaker is Closed again.
        breaker.call(ok).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("model-a", config());
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        tokio::time::advance(Duration::from_millis(60)).await;
        let _ = breaker.call(fail).await;
        let err = breaker.call(ok).await.unwrap_err();
        assert!(matches!(err, ContentEngineError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = CircuitBreaker::new("model-a", config());
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        breaker.reset().await;
        breaker.call(ok).await.unwrap();
    }
}
