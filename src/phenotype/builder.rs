//! PhenotypeBuilder — turns a validated genome into a live phenotype
//!
//! Each unit is instantiated from the unit registry by kind and attached to the
//! bindings its kind requires. Bindings are resolved late, concurrently, and
//! each resolution passes through the circuit breaker of its endpoint.

use super::capability::{CapabilityResolver, GuardedCapability, ResolutionError};
use super::unit::{AttachedCapability, ExecutableUnit, ExecutionError, UnitRegistry, FALLBACK_PARAM};
use crate::genome::{Binding, GenomeError, GenomeHeader, GenomeModel, ParamValue, UnitKind};
use crate::resilience::BreakerRegistry;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Errors raised while building a phenotype
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Genome(#[from] GenomeError),

    #[error("unknown unit kind '{kind}'")]
    UnknownUnitKind { kind: UnitKind },

    #[error("unit '{unit}' has invalid parameters: {reason}")]
    InvalidParameters { unit: String, reason: String },

    #[error("unresolved capability '{name}': {reason}")]
    UnresolvedCapability { name: String, reason: String },
}

/// A binding as held by a running phenotype
pub struct LiveBinding {
    definition: Binding,
    handle: Option<Arc<GuardedCapability>>,
    resolution_error: Option<String>,
}

impl LiveBinding {
    /// Configuration the binding was built from
    pub fn definition(&self) -> &Binding {
        &self.definition
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.is_some()
    }

    pub fn resolution_error(&self) -> Option<&str> {
        self.resolution_error.as_deref()
    }

    /// Calls routed to this binding so far
    pub fn calls(&self) -> u64 {
        self.handle.as_ref().map_or(0, |h| h.calls())
    }
}

/// A live, executable instance built from a genome. Never serialized
/// directly; see `PhenotypeEncoder`.
pub struct Phenotype {
    header: GenomeHeader,
    policy_digest: String,
    units: Vec<ExecutableUnit>,
    bindings: Vec<LiveBinding>,
    built_at: DateTime<Utc>,
}

impl Phenotype {
    pub fn header(&self) -> &GenomeHeader {
        &self.header
    }

    pub fn instance_identifier(&self) -> &str {
        &self.header.instance_identifier
    }

    pub fn policy_digest(&self) -> &str {
        &self.policy_digest
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn units(&self) -> &[ExecutableUnit] {
        &self.units
    }

    pub fn unit(&self, name: &str) -> Option<&ExecutableUnit> {
        self.units.iter().find(|u| u.name() == name)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name()).collect()
    }

    pub fn bindings(&self) -> &[LiveBinding] {
        &self.bindings
    }

    /// True when any unit answers with its fallback instead of a capability
    pub fn is_degraded(&self) -> bool {
        self.units.iter().any(|u| u.is_degraded())
    }

    /// Declared unit costs plus binding price caps
    pub fn cost_estimate(&self) -> f64 {
        let units: f64 = self.units.iter().map(|u| u.definition().cost_estimate).sum();
        let bindings: f64 = self.bindings.iter().map(|b| b.definition.price_cap).sum();
        units + bindings
    }

    /// (binding name, calls) in declaration order
    pub fn binding_usage(&self) -> Vec<(&str, u64)> {
        self.bindings
            .iter()
            .map(|b| (b.definition.name.as_str(), b.calls()))
            .collect()
    }

    /// Run one unit. The only operation that mutates a phenotype.
    pub async fn execute(&mut self, unit_name: &str, input: ParamValue) -> Result<ParamValue, ExecutionError> {
        let unit = self
            .units
            .iter_mut()
            .find(|u| u.name() == unit_name)
            .ok_or_else(|| ExecutionError::UnknownUnit(unit_name.to_string()))?;
        debug!("Executing unit {} ({})", unit_name, unit.kind());
        unit.execute(input).await
    }
}

/// Builds phenotypes from genomes
pub struct PhenotypeBuilder {
    registry: UnitRegistry,
    breakers: Arc<BreakerRegistry>,
}

impl PhenotypeBuilder {
    /// Builder with every built-in unit kind
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self::with_registry(UnitRegistry::builtin(), breakers)
    }

    pub fn with_registry(registry: UnitRegistry, breakers: Arc<BreakerRegistry>) -> Self {
        Self { registry, breakers }
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    pub async fn build(
        &self,
        model: &GenomeModel,
        resolver: &dyn CapabilityResolver,
    ) -> Result<Phenotype, BuildError> {
        model.validate()?;

        // Plan every unit before touching the network
        let mut plans = Vec::with_capacity(model.units.len());
        let mut wanted = BTreeSet::new();
        for unit in &model.units {
            let behavior = self
                .registry
                .get(unit.kind)
                .ok_or(BuildError::UnknownUnitKind { kind: unit.kind })?;
            let required = behavior
                .required_bindings(unit)
                .map_err(|reason| BuildError::InvalidParameters {
                    unit: unit.name.clone(),
                    reason,
                })?;
            for name in &required {
                if model.binding(name).is_none() {
                    return Err(BuildError::UnresolvedCapability {
                        name: name.clone(),
                        reason: format!("unit '{}' requires a binding the genome does not declare", unit.name),
                    });
                }
                wanted.insert(name.clone());
            }
            plans.push((unit, behavior, required));
        }

        let resolutions = join_all(model.bindings.iter().map(|binding| {
            let needed = wanted.contains(&binding.name);
            async move {
                if needed {
                    Some(self.resolve_binding(binding, resolver).await)
                } else {
                    None
                }
            }
        }))
        .await;

        let bindings: Vec<LiveBinding> = model
            .bindings
            .iter()
            .zip(resolutions)
            .map(|(definition, resolution)| match resolution {
                Some(Ok(handle)) => LiveBinding {
                    definition: definition.clone(),
                    handle: Some(handle),
                    resolution_error: None,
                },
                Some(Err(e)) => LiveBinding {
                    definition: definition.clone(),
                    handle: None,
                    resolution_error: Some(e.reason),
                },
                None => LiveBinding {
                    definition: definition.clone(),
                    handle: None,
                    resolution_error: None,
                },
            })
            .collect();

        let mut units = Vec::with_capacity(plans.len());
        for (unit, behavior, required) in plans {
            let has_fallback = unit.parameters.contains_key(FALLBACK_PARAM);
            let mut attached = Vec::with_capacity(required.len());
            for name in required {
                let live = bindings
                    .iter()
                    .find(|b| b.definition.name == name)
                    .ok_or_else(|| BuildError::UnresolvedCapability {
                        name: name.clone(),
                        reason: "binding vanished during build".to_string(),
                    })?;
                match &live.handle {
                    Some(handle) => attached.push(AttachedCapability::live(name, handle.clone())),
                    None if has_fallback => {
                        warn!(
                            "Unit {} degraded: binding {} unresolved ({})",
                            unit.name,
                            name,
                            live.resolution_error().unwrap_or("not resolved")
                        );
                        attached.push(AttachedCapability::degraded(name));
                    }
                    None => {
                        return Err(BuildError::UnresolvedCapability {
                            reason: live.resolution_error().unwrap_or("not resolved").to_string(),
                            name,
                        })
                    }
                }
            }
            units.push(ExecutableUnit::new(unit.clone(), behavior, attached));
        }

        let phenotype = Phenotype {
            header: model.header.clone(),
            policy_digest: model.policy_digest.clone(),
            units,
            bindings,
            built_at: Utc::now(),
        };
        info!(
            "Built phenotype {} ({} units, {} bindings{})",
            phenotype.instance_identifier(),
            phenotype.unit_count(),
            phenotype.bindings.len(),
            if phenotype.is_degraded() { ", degraded" } else { "" }
        );
        Ok(phenotype)
    }

    async fn resolve_binding(
        &self,
        binding: &Binding,
        resolver: &dyn CapabilityResolver,
    ) -> Result<Arc<GuardedCapability>, ResolutionError> {
        let breaker = self.breakers.for_endpoint(&binding.endpoint);
        let callable = {
            let permit = breaker.try_acquire().map_err(|e| ResolutionError {
                reference: binding.capability_reference.clone(),
                reason: e.to_string(),
            })?;
            match resolver.resolve(&binding.capability_reference).await {
                Ok(callable) => {
                    permit.success();
                    callable
                }
                Err(e) => {
                    debug!("Resolving binding {} failed: {}", binding.name, e);
                    permit.failure();
                    return Err(e);
                }
            }
        };
        Ok(Arc::new(GuardedCapability::new(&binding.name, callable, breaker)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::{sample_genome, zero_digest, Unit};
    use crate::phenotype::capability::TestResolver;
    use crate::phenotype::unit::EchoBehavior;
    use crate::resilience::CircuitBreakerConfig;
    use serde_json::json;

    fn builder() -> PhenotypeBuilder {
        PhenotypeBuilder::new(Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())))
    }

    #[tokio::test]
    async fn test_scenario_build_with_noop_resolver() {
        let mut genome = GenomeModel::minimal("unit-test-1", zero_digest());
        genome.units.push(Unit::new("proc", UnitKind::Echo));
        let phenotype = builder().build(&genome, &TestResolver::noop()).await.unwrap();
        assert_eq!(phenotype.unit_count(), 1);
        assert_eq!(phenotype.unit_names(), vec!["proc"]);
    }

    #[tokio::test]
    async fn test_build_and_execute_sample() {
        let resolver = TestResolver::noop();
        let mut phenotype = builder().build(&sample_genome(), &resolver).await.unwrap();
        assert_eq!(resolver.resolutions(), 2);
        assert!(!phenotype.is_degraded());

        let out = phenotype.execute("lookup", json!("rust")).await.unwrap();
        assert_eq!(out["capability"], "mcp:duckduckgo");
        let out = phenotype.execute("survey", json!("rust")).await.unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
        assert_eq!(out[1]["capability"], "mcp:arxiv");

        assert_eq!(phenotype.binding_usage(), vec![("search", 2), ("archive", 1)]);
        assert_eq!(phenotype.unit("survey").unwrap().invocations(), 1);
        assert!((phenotype.cost_estimate() - 1.76).abs() < 1e-9);
        assert!(matches!(
            phenotype.execute("missing", json!(null)).await,
            Err(ExecutionError::UnknownUnit(_))
        ));
    }

    #[tokio::test]
    async fn test_unresolved_capability_without_fallback() {
        let resolver = TestResolver::noop().failing("mcp:arxiv");
        let err = builder().build(&sample_genome(), &resolver).await.err().unwrap();
        assert!(matches!(err, BuildError::UnresolvedCapability { ref name, .. } if name == "archive"));
    }

    #[tokio::test]
    async fn test_fallback_builds_degraded_unit() {
        let mut genome = sample_genome();
        genome.units[2] = genome.units[2].clone().with_param("fallback", json!("offline"));
        let resolver = TestResolver::noop().failing("mcp:arxiv");
        let mut phenotype = builder().build(&genome, &resolver).await.unwrap();
        assert!(phenotype.is_degraded());
        assert!(!phenotype.bindings()[1].is_resolved());
        let out = phenotype.execute("survey", json!("q")).await.unwrap();
        assert_eq!(out[1], json!("offline"));
    }

    #[tokio::test]
    async fn test_unregistered_kind_rejected() {
        let narrow = PhenotypeBuilder::with_registry(
            UnitRegistry::empty().with(UnitKind::Echo, Arc::new(EchoBehavior)),
            Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())),
        );
        let err = narrow.build(&sample_genome(), &TestResolver::noop()).await.err().unwrap();
        assert!(matches!(err, BuildError::UnknownUnitKind { kind: UnitKind::Relay }));
    }

    #[tokio::test]
    async fn test_undeclared_binding_and_bad_params() {
        let mut genome = sample_genome();
        genome.units[1] = Unit::new("lookup", UnitKind::Relay).with_param("binding", json!("nowhere"));
        let err = builder().build(&genome, &TestResolver::noop()).await.err().unwrap();
        assert!(matches!(err, BuildError::UnresolvedCapability { ref name, .. } if name == "nowhere"));

        genome.units[1] = Unit::new("lookup", UnitKind::Relay);
        let err = builder().build(&genome, &TestResolver::noop()).await.err().unwrap();
        assert!(matches!(err, BuildError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn test_unreferenced_bindings_are_not_resolved() {
        let mut genome = sample_genome();
        genome.units.truncate(1);
        let resolver = TestResolver::noop();
        let phenotype = builder().build(&genome, &resolver).await.unwrap();
        assert_eq!(resolver.resolutions(), 0);
        assert_eq!(phenotype.bindings().len(), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_resolution() {
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        let builder = PhenotypeBuilder::new(breakers.clone());
        let failing = TestResolver::noop().failing("mcp:arxiv");
        assert!(builder.build(&sample_genome(), &failing).await.is_err());

        // The archive endpoint is now open, so even a healthy resolver is refused
        let healthy = TestResolver::noop();
        let err = builder.build(&sample_genome(), &healthy).await.err().unwrap();
        assert!(matches!(err, BuildError::UnresolvedCapability { ref reason, .. } if reason.contains("circuit open")));
        assert_eq!(healthy.resolutions(), 1);
    }
}
