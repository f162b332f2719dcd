//! Capabilities — external tools/services a phenotype's units can call
//!
//! Bindings in a genome name a capability by an opaque reference. At build
//! time a resolver turns each reference into a live callable. Two resolver
//! variants exist and one is picked when the host is wired up:
//! - **LiveResolver**: host-registered connectors, connected late on every resolve
//! - **TestResolver**: in-process stand-ins with scriptable failures

use crate::genome::ParamValue;
use crate::resilience::{CircuitBreaker, CircuitOpen};
use async_trait::async_trait;
use log::debug;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Errors raised when invoking a capability
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability '{reference}' failed: {reason}")]
    Failed { reference: String, reason: String },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
}

/// Raised by a resolver that cannot produce a callable
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot resolve capability '{reference}': {reason}")]
pub struct ResolutionError {
    pub reference: String,
    pub reason: String,
}

/// A callable external capability
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, input: ParamValue) -> Result<ParamValue, CapabilityError>;
}

/// Shared handle to a resolved capability
pub type Callable = Arc<dyn Capability>;

/// Turns a binding's capability reference into a callable
#[async_trait]
pub trait CapabilityResolver: Send + Sync {
    async fn resolve(&self, capability_reference: &str) -> Result<Callable, ResolutionError>;
}

/// Connects to a live capability. Called on every resolution.
pub type Connector = Arc<dyn Fn(&str) -> Result<Callable, String> + Send + Sync>;

/// Resolver backed by connectors the host registers per reference
#[derive(Default)]
pub struct LiveResolver {
    connectors: HashMap<String, Connector>,
}

impl LiveResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability_reference: impl Into<String>, connector: Connector) {
        self.connectors.insert(capability_reference.into(), connector);
    }

    pub fn with(mut self, capability_reference: impl Into<String>, connector: Connector) -> Self {
        self.register(capability_reference, connector);
        self
    }

    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.connectors.keys().map(|k| k.as_str()).collect();
        refs.sort();
        refs
    }
}

#[async_trait]
impl CapabilityResolver for LiveResolver {
    async fn resolve(&self, capability_reference: &str) -> Result<Callable, ResolutionError> {
        let connector = self
            .connectors
            .get(capability_reference)
            .ok_or_else(|| ResolutionError {
                reference: capability_reference.to_string(),
                reason: "no connector registered".to_string(),
            })?;
        connector(capability_reference).map_err(|reason| ResolutionError {
            reference: capability_reference.to_string(),
            reason,
        })
    }
}

/// In-process stand-in: answers `{"capability": ref, "input": input}`
pub struct EchoCapability {
    reference: String,
}

impl EchoCapability {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }
}

#[async_trait]
impl Capability for EchoCapability {
    async fn invoke(&self, input: ParamValue) -> Result<ParamValue, CapabilityError> {
        Ok(json!({ "capability": self.reference, "input": input }))
    }
}

/// Resolver for tests and dry runs
#[derive(Default)]
pub struct TestResolver {
    unresolvable: HashSet<String>,
    resolutions: AtomicUsize,
}

impl TestResolver {
    /// Resolves every reference to an `EchoCapability`
    pub fn noop() -> Self {
        Self::default()
    }

    /// Make resolution of `capability_reference` fail
    pub fn failing(mut self, capability_reference: impl Into<String>) -> Self {
        self.unresolvable.insert(capability_reference.into());
        self
    }

    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityResolver for TestResolver {
    async fn resolve(&self, capability_reference: &str) -> Result<Callable, ResolutionError> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        if self.unresolvable.contains(capability_reference) {
            return Err(ResolutionError {
                reference: capability_reference.to_string(),
                reason: "marked unresolvable".to_string(),
            });
        }
        Ok(Arc::new(EchoCapability::new(capability_reference)))
    }
}

/// The resolver a host runs with, chosen once at wiring time
pub enum Resolver {
    Live(LiveResolver),
    Test(TestResolver),
}

impl Resolver {
    pub fn variant(&self) -> &'static str {
        match self {
            Resolver::Live(_) => "live",
            Resolver::Test(_) => "test",
        }
    }
}

#[async_trait]
impl CapabilityResolver for Resolver {
    async fn resolve(&self, capability_reference: &str) -> Result<Callable, ResolutionError> {
        match self {
            Resolver::Live(r) => r.resolve(capability_reference).await,
            Resolver::Test(r) => r.resolve(capability_reference).await,
        }
    }
}

/// A resolved capability routed through its endpoint's circuit breaker
pub struct GuardedCapability {
    binding: String,
    inner: Callable,
    breaker: Arc<CircuitBreaker>,
    calls: AtomicU64,
}

impl GuardedCapability {
    pub fn new(binding: impl Into<String>, inner: Callable, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            binding: binding.into(),
            inner,
            breaker,
            calls: AtomicU64::new(0),
        }
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Invocations attempted through this handle, including refused ones
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for GuardedCapability {
    async fn invoke(&self, input: ParamValue) -> Result<ParamValue, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self.breaker.try_acquire()?;
        match self.inner.invoke(input).await {
            Ok(out) => {
                permit.success();
                Ok(out)
            }
            Err(e) => {
                debug!("Binding {} call failed: {}", self.binding, e);
                permit.failure();
                Err(e)
            }
        }
    }
}
