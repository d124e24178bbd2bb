//! Circuit breaker for a protected downstream operation.
//!
//! One breaker instance guards one class of operation (for example "load
//! question from the database"), not one key. When the downstream fails
//! repeatedly the breaker opens and callers fail fast instead of piling
//! more load onto a struggling dependency.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Consecutive successes required in half-open state before closing.
const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 3;

/// Breaker tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,

    /// How long the breaker stays open before probing the downstream again.
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    Closed,
    /// Failing fast; the downstream is not called.
    Open,
    /// Probing; a few successes close the breaker, any failure reopens it.
    HalfOpen,
}

/// Error wrapper returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker is open; the operation was not invoked.
    #[error("circuit breaker is open")]
    Open,
    /// The operation ran and failed with its own error.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Per-operation circuit breaker.
///
/// `execute` may be called concurrently on the same instance; the counters
/// sit behind a mutex that is never held across the awaited operation.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails immediately with [`CircuitError::Open`] while the breaker is
    /// open and the recovery timeout has not elapsed. The open-to-half-open
    /// transition is lazy: it happens on the first call after the timeout,
    /// not on a timer.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            return Err(CircuitError::Open);
        }
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Current state, as last recorded. An elapsed recovery timeout is only
    /// reflected once the next call attempts the half-open probe.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() > self.config.recovery_timeout);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!("circuit breaker half-open, probing downstream");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= HALF_OPEN_SUCCESS_THRESHOLD {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    tracing::info!("circuit breaker closed");
                }
            }
            // A success can land here when a call admitted before the trip
            // completes after it; the open state stands until the timeout.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!("circuit breaker reopened after half-open failure");
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        })
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await.map(|_| ())
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        b.execute(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(CircuitError::Inner(_))));
        }
        assert_eq!(b.state(), CircuitState::Open);

        // Open breaker rejects without invoking the operation.
        let mut invoked = false;
        let result = b
            .execute(|| {
                invoked = true;
                async { Ok::<_, &'static str>(()) }
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Open)));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let b = breaker(3, Duration::from_secs(60));
        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        assert!(succeed(&b).await.is_ok());
        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_three_successes() {
        let b = breaker(1, Duration::from_millis(20));
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(succeed(&b).await.is_ok());
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker(1, Duration::from_millis(20));
        assert!(fail(&b).await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }
}
