//! RetryPolicy — bounded exponential backoff with jitter
//!
//! Every attempt passes through a circuit breaker. Only errors classified as
//! retryable are retried; fatal errors and open circuits surface immediately.

use super::circuit_breaker::{CircuitBreaker, CircuitOpen};
use super::Retryable;
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay within [delay/2, delay]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Shared retry executor; counts every retry it performs.
pub struct RetryPolicy {
    pub config: RetryConfig,
    retries: AtomicU64,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retries: AtomicU64::new(0),
        }
    }

    /// Total retries performed (first attempts are not counted)
    pub fn retries_performed(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Backoff before retry number `retry` (0-based), without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let spread = (delay - half).as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Run `op` until it succeeds, fails fatally, the circuit opens, or the
    /// retry budget is spent.
    pub async fn run<T, E, F, Fut>(&self, label: &str, breaker: &CircuitBreaker, mut op: F) -> Result<T, E>
    where
        E: Retryable + From<CircuitOpen> + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let permit = breaker.try_acquire().map_err(E::from)?;
            match op().await {
                Ok(value) => {
                    permit.success();
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    // The endpoint answered; the request itself was refused.
                    permit.success();
                    return Err(e);
                }
                Err(e) => {
                    permit.failure();
                    if attempt >= self.config.max_retries {
                        warn!("{} failed after {} attempts: {}", label, attempt + 1, e);
                        return Err(e);
                    }
                    let delay = self.jittered(self.backoff(attempt));
                    warn!(
                        "{} attempt {} failed: {} (retrying in {:?})",
                        label,
                        attempt + 1,
                        e,
                        delay
                    );
                    self.retries.fetch_add(1, Ordering::SeqCst);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
        Open,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    impl From<CircuitOpen> for TestError {
        fn from(_: CircuitOpen) -> Self {
            TestError::Open
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter: true,
        })
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                ..CircuitBreakerConfig::default()
            },
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1_000));
        assert_eq!(p.backoff(40), Duration::from_millis(1_000));
        for _ in 0..50 {
            let d = p.jittered(Duration::from_millis(800));
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(800));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let p = policy(3);
        let b = breaker(10);
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> = p
            .run("flaky", &b, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(p.retries_performed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let p = policy(2);
        let b = breaker(10);
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = p
            .run("down", &b, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;
        assert_eq!(result, Err(TestError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(p.retries_performed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_never_retried() {
        let p = policy(5);
        let b = breaker(10);
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = p
            .run("fatal", &b, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            })
            .await;
        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.retries_performed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retries_without_calling() {
        let p = policy(10);
        let b = breaker(2);
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = p
            .run("breaker", &b, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;
        assert_eq!(result, Err(TestError::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let again: Result<(), TestError> = p
            .run("breaker", &b, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(again, Err(TestError::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
