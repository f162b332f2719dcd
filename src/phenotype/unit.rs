//! Executable units — the behaviours behind each `UnitKind`

use super::capability::{Capability, CapabilityError, GuardedCapability};
use crate::genome::{ParamValue, Unit, UnitKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Parameter holding the value a degraded unit answers with
pub const FALLBACK_PARAM: &str = "fallback";

/// Errors raised while executing a built phenotype
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("phenotype has no unit named '{0}'")]
    UnknownUnit(String),

    #[error("unit '{unit}' failed: {source}")]
    Capability {
        unit: String,
        #[source]
        source: CapabilityError,
    },
}

/// A binding attached to a unit. `callable` is `None` when the unit was
/// built degraded and answers with its fallback instead.
#[derive(Clone)]
pub struct AttachedCapability {
    binding: String,
    callable: Option<Arc<GuardedCapability>>,
}

impl AttachedCapability {
    pub fn live(binding: impl Into<String>, callable: Arc<GuardedCapability>) -> Self {
        Self {
            binding: binding.into(),
            callable: Some(callable),
        }
    }

    pub fn degraded(binding: impl Into<String>) -> Self {
        Self {
            binding: binding.into(),
            callable: None,
        }
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn is_live(&self) -> bool {
        self.callable.is_some()
    }

    async fn call(
        &self,
        input: ParamValue,
        fallback: Option<&ParamValue>,
    ) -> Result<ParamValue, CapabilityError> {
        match &self.callable {
            Some(callable) => callable.invoke(input).await,
            None => Ok(fallback.cloned().unwrap_or(ParamValue::Null)),
        }
    }
}

/// Behaviour shared by every unit of one kind
#[async_trait]
pub trait UnitBehavior: Send + Sync {
    /// Binding names the unit attaches, in call order
    fn required_bindings(&self, unit: &Unit) -> Result<Vec<String>, String>;

    async fn run(
        &self,
        input: ParamValue,
        capabilities: &[AttachedCapability],
        fallback: Option<&ParamValue>,
    ) -> Result<ParamValue, CapabilityError>;
}

pub struct EchoBehavior;

#[async_trait]
impl UnitBehavior for EchoBehavior {
    fn required_bindings(&self, _unit: &Unit) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }

    async fn run(
        &self,
        input: ParamValue,
        _capabilities: &[AttachedCapability],
        _fallback: Option<&ParamValue>,
    ) -> Result<ParamValue, CapabilityError> {
        Ok(input)
    }
}

pub struct RelayBehavior;

#[async_trait]
impl UnitBehavior for RelayBehavior {
    fn required_bindings(&self, unit: &Unit) -> Result<Vec<String>, String> {
        match unit.parameters.get("binding") {
            Some(ParamValue::String(name)) => Ok(vec![name.clone()]),
            Some(_) => Err("parameter 'binding' must be a string".to_string()),
            None => Err("missing parameter 'binding'".to_string()),
        }
    }

    async fn run(
        &self,
        input: ParamValue,
        capabilities: &[AttachedCapability],
        fallback: Option<&ParamValue>,
    ) -> Result<ParamValue, CapabilityError> {
        match capabilities.first() {
            Some(cap) => cap.call(input, fallback).await,
            None => Ok(fallback.cloned().unwrap_or(ParamValue::Null)),
        }
    }
}

pub struct FanoutBehavior;

#[async_trait]
impl UnitBehavior for FanoutBehavior {
    fn required_bindings(&self, unit: &Unit) -> Result<Vec<String>, String> {
        let items = match unit.parameters.get("bindings") {
            Some(ParamValue::Array(items)) => items,
            Some(_) => return Err("parameter 'bindings' must be a list".to_string()),
            None => return Err("missing parameter 'bindings'".to_string()),
        };
        let mut names = Vec::with_capacity(items.len());
        for item in items {
            let name = item
                .as_str()
                .ok_or_else(|| "parameter 'bindings' may only hold strings".to_string())?;
            if names.iter().any(|n| n == name) {
                return Err(format!("binding '{}' listed twice", name));
            }
            names.push(name.to_string());
        }
        Ok(names)
    }

    async fn run(
        &self,
        input: ParamValue,
        capabilities: &[AttachedCapability],
        fallback: Option<&ParamValue>,
    ) -> Result<ParamValue, CapabilityError> {
        let mut results = Vec::with_capacity(capabilities.len());
        for cap in capabilities {
            results.push(cap.call(input.clone(), fallback).await?);
        }
        Ok(ParamValue::Array(results))
    }
}

/// Maps unit kinds to the behaviour the builder instantiates for them
#[derive(Clone, Default)]
pub struct UnitRegistry {
    behaviors: HashMap<UnitKind, Arc<dyn UnitBehavior>>,
}

impl UnitRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind
    pub fn builtin() -> Self {
        Self::empty()
            .with(UnitKind::Echo, Arc::new(EchoBehavior))
            .with(UnitKind::Relay, Arc::new(RelayBehavior))
            .with(UnitKind::Fanout, Arc::new(FanoutBehavior))
    }

    pub fn with(mut self, kind: UnitKind, behavior: Arc<dyn UnitBehavior>) -> Self {
        self.behaviors.insert(kind, behavior);
        self
    }

    pub fn get(&self, kind: UnitKind) -> Option<Arc<dyn UnitBehavior>> {
        self.behaviors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<UnitKind> {
        let mut kinds: Vec<UnitKind> = self.behaviors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// A unit instantiated inside a phenotype
pub struct ExecutableUnit {
    definition: Unit,
    behavior: Arc<dyn UnitBehavior>,
    capabilities: Vec<AttachedCapability>,
    invocations: u64,
}

impl ExecutableUnit {
    pub fn new(definition: Unit, behavior: Arc<dyn UnitBehavior>, capabilities: Vec<AttachedCapability>) -> Self {
        Self {
            definition,
            behavior,
            capabilities,
            invocations: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn kind(&self) -> UnitKind {
        self.definition.kind
    }

    /// Configuration the unit was built from
    pub fn definition(&self) -> &Unit {
        &self.definition
    }

    pub fn capabilities(&self) -> &[AttachedCapability] {
        &self.capabilities
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn is_degraded(&self) -> bool {
        self.capabilities.iter().any(|c| !c.is_live())
    }

    pub(crate) async fn execute(&mut self, input: ParamValue) -> Result<ParamValue, ExecutionError> {
        self.invocations += 1;
        let fallback = self.definition.parameters.get(FALLBACK_PARAM);
        self.behavior
            .run(input, &self.capabilities, fallback)
            .await
            .map_err(|source| ExecutionError::Capability {
                unit: self.definition.name.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_bindings() {
        let relay = Unit::new("lookup", UnitKind::Relay).with_param("binding", json!("search"));
        assert_eq!(RelayBehavior.required_bindings(&relay).unwrap(), vec!["search"]);
        let bare = Unit::new("lookup", UnitKind::Relay);
        assert!(RelayBehavior.required_bindings(&bare).is_err());

        let fanout = Unit::new("survey", UnitKind::Fanout).with_param("bindings", json!(["a", "b"]));
        assert_eq!(FanoutBehavior.required_bindings(&fanout).unwrap(), vec!["a", "b"]);
        let twice = Unit::new("survey", UnitKind::Fanout).with_param("bindings", json!(["a", "a"]));
        assert!(FanoutBehavior.required_bindings(&twice).is_err());
        let mixed = Unit::new("survey", UnitKind::Fanout).with_param("bindings", json!(["a", 3]));
        assert!(FanoutBehavior.required_bindings(&mixed).is_err());
    }

    #[tokio::test]
    async fn test_degraded_units_answer_with_fallback() {
        let caps = vec![AttachedCapability::degraded("search")];
        let fallback = json!({"results": []});
        let out = RelayBehavior.run(json!("q"), &caps, Some(&fallback)).await.unwrap();
        assert_eq!(out, fallback);

        let out = FanoutBehavior
            .run(json!("q"), &[caps[0].clone(), caps[0].clone()], Some(&fallback))
            .await
            .unwrap();
        assert_eq!(out, json!([fallback.clone(), fallback]));
    }

    #[tokio::test]
    async fn test_echo_unit_counts_invocations() {
        let mut unit = ExecutableUnit::new(Unit::new("proc", UnitKind::Echo), Arc::new(EchoBehavior), Vec::new());
        assert_eq!(unit.execute(json!({"n": 1})).await.unwrap(), json!({"n": 1}));
        unit.execute(json!(null)).await.unwrap();
        assert_eq!(unit.invocations(), 2);
        assert!(!unit.is_degraded());
    }

    #[test]
    fn test_registry_kinds() {
        assert_eq!(UnitRegistry::builtin().kinds(), UnitKind::ALL.to_vec());
        let narrow = UnitRegistry::empty().with(UnitKind::Echo, Arc::new(EchoBehavior));
        assert!(narrow.get(UnitKind::Relay).is_none());
    }
}
