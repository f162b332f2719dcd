//! Resilience primitives shared by ledger calls and capability calls
//!
//! - **CircuitBreaker**: fail fast once an endpoint keeps failing
//! - **RetryPolicy**: bounded exponential backoff with jitter
//! - **BreakerRegistry**: one breaker per remote endpoint

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerPermit, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats,
    CircuitOpen, CircuitState,
};
pub use retry::{RetryConfig, RetryPolicy};

/// Classifies an error as transient (worth retrying) or fatal
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}
