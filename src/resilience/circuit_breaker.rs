//! Circuit breaker for remote endpoints.
//!
//! Prevents hammering an unavailable node or capability by tracking
//! consecutive failures and blocking calls until a cooldown elapses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,

    /// Calls fail fast without reaching the endpoint.
    Open,

    /// A single trial call is probing whether the endpoint recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Returned when a call is refused because the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for endpoint '{endpoint}'")]
pub struct CircuitOpen {
    pub endpoint: String,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time to wait before allowing a trial call.
    pub cooldown: Duration,

    /// Factor applied to the cooldown each time a trial call fails.
    pub cooldown_multiplier: f64,

    /// Upper bound for the grown cooldown.
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    trial_in_flight: bool,
    /// Bumped on every transition; permits carry the value they were issued under
    generation: u64,
    last_transition: DateTime<Utc>,
}

/// Circuit breaker for a single endpoint.
///
/// All state lives behind one mutex, so concurrent callers observe and
/// mutate it one at a time.
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                current_cooldown: cooldown,
                trial_in_flight: false,
                generation: 0,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current state, promoting Open to HalfOpen once the cooldown elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.check_cooldown(&mut inner);
        inner.state
    }

    /// Ask to make a call. The permit must be resolved with `success` or
    /// `failure`; dropping it unresolved counts as a failure.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpen> {
        let mut inner = self.lock();
        self.check_cooldown(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, inner.generation, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!("Circuit {} admitting trial call", self.endpoint);
                Ok(BreakerPermit::new(self, inner.generation, true))
            }
            _ => Err(CircuitOpen {
                endpoint: self.endpoint.clone(),
            }),
        }
    }

    /// Record a successful operation made without a permit. Only counts
    /// while closed; a half-open circuit is resolved by its trial alone.
    pub fn record_success(&self) {
        self.settle(None, false, true);
    }

    /// Record a failed operation made without a permit.
    pub fn record_failure(&self) {
        self.settle(None, false, false);
    }

    /// Apply an outcome. A `stamp` from an earlier generation is stale: the
    /// call was admitted under a state the breaker has since left.
    fn settle(&self, stamp: Option<u64>, trial: bool, succeeded: bool) {
        let mut inner = self.lock();
        if stamp.map_or(false, |generation| generation != inner.generation) {
            debug!("Ignoring stale outcome on circuit {}", self.endpoint);
            return;
        }
        match (inner.state, succeeded) {
            (CircuitState::Closed, true) => {
                inner.failure_count = 0;
            }
            (CircuitState::Closed, false) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit {} opening after {} consecutive failures",
                        self.endpoint, inner.failure_count
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) if trial => {
                info!("Circuit {} closing after successful trial call", self.endpoint);
                inner.current_cooldown = self.config.cooldown;
                self.transition_to(&mut inner, CircuitState::Closed);
            }
            (CircuitState::HalfOpen, false) if trial => {
                let grown = inner.current_cooldown.mul_f64(self.config.cooldown_multiplier.max(1.0));
                inner.current_cooldown = grown.min(self.config.max_cooldown.max(self.config.cooldown));
                warn!(
                    "Circuit {} re-opening after failed trial call (cooldown {:?})",
                    self.endpoint, inner.current_cooldown
                );
                self.transition_to(&mut inner, CircuitState::Open);
            }
            (state, _) => {
                debug!("Outcome ignored while circuit {} {}", self.endpoint, state);
            }
        }
    }

    /// Reset to closed, clearing counters and the grown cooldown.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.current_cooldown = self.config.cooldown;
        self.transition_to(&mut inner, CircuitState::Closed);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.check_cooldown(&mut inner);
        CircuitBreakerStats {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            current_cooldown_ms: inner.current_cooldown.as_millis() as u64,
            last_transition: inner.last_transition,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_cooldown(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if opened_at.elapsed() >= inner.current_cooldown {
                info!("Circuit {} half-open after cooldown", self.endpoint);
                self.transition_to(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn transition_to(&self, inner: &mut BreakerState, new_state: CircuitState) {
        inner.state = new_state;
        inner.generation += 1;
        inner.last_transition = Utc::now();
        inner.trial_in_flight = false;

        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Admission ticket for one call through a breaker.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            resolved: false,
        }
    }

    /// Whether this is the single half-open trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.settle(Some(self.generation), self.trial, true);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.settle(Some(self.generation), self.trial, false);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.settle(Some(self.generation), self.trial, false);
        }
    }
}

/// Statistics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub current_cooldown_ms: u64,
    pub last_transition: DateTime<Utc>,
}

/// Hands out one shared breaker per endpoint.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_endpoint(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.clone())))
            .clone()
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stats: Vec<_> = breakers.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }
}
