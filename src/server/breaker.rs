//! Circuit breaker guarding store access
//!
//! Wraps downstream calls and trips open after consecutive transient
//! failures. While open, calls are refused immediately and the caller
//! runs its fallback (informing the client instead of blocking on a
//! dead store). After the reset timeout a limited number of probe
//! calls decide whether to close again.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Result, TandemError};

/// Breaker tuning per guarded component
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive transient failures before the breaker opens
    pub failure_threshold: u32,
    /// How long to stay open before probing
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close
    pub half_open_max_attempts: u32,
}

impl BreakerConfig {
    /// Defaults for the matcher path
    pub fn matcher() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            half_open_max_attempts: 2,
        }
    }

    /// Defaults for the chat path
    pub fn chat() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 3,
        }
    }
}

/// Breaker state machine: closed -> open -> half_open -> closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Instant,
}

/// A named circuit breaker instance
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: Instant::now(),
            }),
        }
    }

    /// Current state (open breakers past their timeout report half-open)
    pub async fn state(&self) -> BreakerState {
        let inner = self.inner.lock().await;
        if inner.state == BreakerState::Open
            && inner.opened_at.elapsed() >= self.config.reset_timeout
        {
            BreakerState::HalfOpen
        } else {
            inner.state
        }
    }

    /// Run `op` under the breaker
    ///
    /// Transient errors are retried once before counting as a failure.
    /// While open, returns StoreUnavailable without invoking `op`.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call().await?;

        let mut result = op().await;
        if matches!(&result, Err(e) if e.is_transient()) {
            result = op().await;
        }

        match result {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if err.is_transient() {
                    self.record_failure().await;
                }
                Err(err)
            }
        }
    }

    async fn before_call(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= self.config.reset_timeout {
                    info!(breaker = self.name, "circuit breaker probing (half-open)");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(TandemError::store_unavailable(
                        "service temporarily unavailable",
                    ))
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_attempts {
                    info!(breaker = self.name, "circuit breaker closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                }
            }
            _ => {
                inner.consecutive_failures = 0;
            }
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = self.name, "probe failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = self.name,
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Instant::now();
                }
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(60),
                half_open_max_attempts: 2,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Err::<(), _>(TandemError::store_unavailable("down")) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let b = breaker();

        for _ in 0..3 {
            assert!(fail(&b).await.is_err());
        }
        assert_eq!(b.state().await, BreakerState::Open);

        // Calls are refused without running the operation
        let mut ran = false;
        let result = b
            .call(|| {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert!(result.is_err());
        assert!(!ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let b = breaker();

        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state().await, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(b.state().await, BreakerState::HalfOpen);

        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state().await, BreakerState::HalfOpen);

        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state().await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let b = breaker();

        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        // The probe fails: straight back to open with a fresh timer
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state().await, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_transient_retried_once() {
        let b = breaker();
        let mut attempts = 0;

        let result = b
            .call(|| {
                attempts += 1;
                let first = attempts == 1;
                async move {
                    if first {
                        Err(TandemError::store_unavailable("blip"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 2);
        assert_eq!(b.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_non_transient_errors_do_not_trip() {
        let b = breaker();

        for _ in 0..10 {
            let result = b
                .call(|| async { Err::<(), _>(TandemError::validation("bad input")) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(b.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker();

        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert!(succeed(&b).await.is_ok());
        let _ = fail(&b).await;
        let _ = fail(&b).await;

        // Never reached three consecutive failures
        assert_eq!(b.state().await, BreakerState::Closed);
    }
}
