//! AnchorConfig — tuning for anchoring, retries and circuit breaking
//!
//! Loaded from YAML. Every key is optional and unknown keys are rejected.

use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnchorConfig {
    /// Confirmation depth required before an anchor is durable
    pub finality_threshold: u64,
    /// Wall-clock bound on tracking a submitted transaction
    pub timeout_seconds: u64,
    /// Consecutive failures before a node endpoint's circuit opens
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
    /// Retries for fee estimation and submission
    pub max_retries: u32,
    pub poll_interval_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Cooldown growth after a failed half-open trial
    pub cooldown_multiplier: f64,
    pub max_cooldown_seconds: u64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            finality_threshold: 6,
            timeout_seconds: 120,
            failure_threshold: 5,
            cooldown_seconds: 30,
            max_retries: 3,
            poll_interval_ms: 2_000,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            cooldown_multiplier: 2.0,
            max_cooldown_seconds: 300,
        }
    }
}

impl AnchorConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.finality_threshold < 1 {
            return invalid("finality_threshold must be at least 1");
        }
        if self.timeout_seconds == 0 {
            return invalid("timeout_seconds must be positive");
        }
        if self.failure_threshold < 1 {
            return invalid("failure_threshold must be at least 1");
        }
        if self.cooldown_seconds == 0 {
            return invalid("cooldown_seconds must be positive");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive");
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return invalid("retry_max_delay_ms must not be below retry_base_delay_ms");
        }
        if !self.cooldown_multiplier.is_finite() || self.cooldown_multiplier < 1.0 {
            return invalid("cooldown_multiplier must be a finite value >= 1");
        }
        if self.max_cooldown_seconds < self.cooldown_seconds {
            return invalid("max_cooldown_seconds must not be below cooldown_seconds");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_seconds),
            cooldown_multiplier: self.cooldown_multiplier,
            max_cooldown: Duration::from_secs(self.max_cooldown_seconds),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: true,
        }
    }
}
