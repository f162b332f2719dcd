//! GenomeModel — the declarative configuration D = (H, U, B, P)
//!
//! A genome is a header, an ordered list of logic units, an ordered list of
//! external-capability bindings and the digest of the policy document the
//! instance operates under. Sequence order is significant; map key order is not.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Length in bytes of `policy_digest` once hex-decoded.
pub const POLICY_DIGEST_LEN: usize = 32;

/// Structured parameter value attached to a unit.
pub type ParamValue = serde_json::Value;

/// Errors raised while validating or decoding a genome
#[derive(Debug, thiserror::Error)]
pub enum GenomeError {
    #[error("malformed genome: {0}")]
    MalformedModel(String),

    #[error("failed to decode genome: {reason}")]
    DecodeError { reason: String },
}

impl GenomeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        GenomeError::MalformedModel(reason.into())
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        GenomeError::DecodeError {
            reason: reason.into(),
        }
    }
}

/// Genome header (H)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenomeHeader {
    /// Version of the genome schema this document follows
    pub schema_version: u32,
    /// Upper bound on resources an instance may consume per execution
    pub resource_limit: u64,
    /// Identifier of the deployed phenotype; immutable once anchored
    pub instance_identifier: String,
}

/// Recognized unit behaviours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Returns its input unchanged
    Echo,
    /// Forwards input to the capability named by parameter `binding`
    Relay,
    /// Invokes every capability listed in parameter `bindings`, in order
    Fanout,
}

impl UnitKind {
    pub const ALL: [UnitKind; 3] = [UnitKind::Echo, UnitKind::Relay, UnitKind::Fanout];

    pub fn tag(&self) -> &'static str {
        match self {
            UnitKind::Echo => "echo",
            UnitKind::Relay => "relay",
            UnitKind::Fanout => "fanout",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A named logic unit (U)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Unit {
    pub name: String,
    pub kind: UnitKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub cost_estimate: f64,
}

impl Unit {
    pub fn new(name: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parameters: BTreeMap::new(),
            cost_estimate: 0.0,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_estimate = cost;
        self
    }
}

/// A named external-capability binding (B)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    pub name: String,
    /// Opaque reference handed to the capability resolver
    pub capability_reference: String,
    pub endpoint: String,
    pub interface_version: String,
    #[serde(default)]
    pub price_cap: f64,
}

impl Binding {
    pub fn new(
        name: impl Into<String>,
        capability_reference: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            capability_reference: capability_reference.into(),
            endpoint: endpoint.into(),
            interface_version: "1.0.0".to_string(),
            price_cap: 0.0,
        }
    }

    pub fn with_price_cap(mut self, cap: f64) -> Self {
        self.price_cap = cap;
        self
    }
}

/// The complete genome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenomeModel {
    pub header: GenomeHeader,
    #[serde(default)]
    pub units: Vec<Unit>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Hex digest of the external policy document, carried through unchanged
    pub policy_digest: String,
}

impl GenomeModel {
    /// Smallest valid genome for bootstrapping a new instance
    pub fn minimal(instance_identifier: impl Into<String>, policy_digest: impl Into<String>) -> Self {
        Self {
            header: GenomeHeader {
                schema_version: 1,
                resource_limit: 1_000_000,
                instance_identifier: instance_identifier.into(),
            },
            units: Vec::new(),
            bindings: Vec::new(),
            policy_digest: policy_digest.into(),
        }
    }

    pub fn instance_identifier(&self) -> &str {
        &self.header.instance_identifier
    }

    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name.as_str()).collect()
    }

    pub fn binding_names(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.name.as_str()).collect()
    }

    /// Apply a partial update for an evolving instance. Objects merge key by
    /// key; anything else, sequences included, replaces the old value. The
    /// result must validate, and the instance identifier may not change.
    pub fn merge(&self, updates: &ParamValue) -> Result<GenomeModel, GenomeError> {
        if !updates.is_object() {
            return Err(GenomeError::malformed("genome updates must be a mapping"));
        }
        let mut merged = serde_json::to_value(self)
            .map_err(|e| GenomeError::malformed(format!("cannot represent genome: {}", e)))?;
        deep_merge(&mut merged, updates);
        let merged: GenomeModel = serde_json::from_value(merged)
            .map_err(|e| GenomeError::malformed(format!("invalid genome update: {}", e)))?;

        if merged.header.instance_identifier != self.header.instance_identifier {
            return Err(GenomeError::malformed(format!(
                "header.instance_identifier is immutable ('{}' cannot become '{}')",
                self.header.instance_identifier, merged.header.instance_identifier
            )));
        }
        merged.validate()?;
        Ok(merged)
    }

    /// Full structural validation. Returns the first violation found.
    pub fn validate(&self) -> Result<(), GenomeError> {
        let errors = self.validation_errors();
        match errors.into_iter().next() {
            Some(first) => Err(GenomeError::MalformedModel(first)),
            None => Ok(()),
        }
    }

    /// Every structural violation, in document order
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let id = &self.header.instance_identifier;
        if id.is_empty() {
            errors.push("header.instance_identifier is empty".to_string());
        } else if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            errors.push(format!(
                "header.instance_identifier '{}' may only contain alphanumerics, '-' and '_'",
                id
            ));
        }

        let mut seen = HashSet::new();
        for unit in &self.units {
            check_name("unit", &unit.name, &mut errors);
            if !seen.insert(unit.name.as_str()) {
                errors.push(format!("duplicate unit name '{}'", unit.name));
            }
            check_amount(&format!("unit '{}' cost_estimate", unit.name), unit.cost_estimate, &mut errors);
            for key in unit.parameters.keys() {
                if key.is_empty() {
                    errors.push(format!("unit '{}' has an empty parameter key", unit.name));
                }
            }
        }

        let mut seen = HashSet::new();
        for binding in &self.bindings {
            check_name("binding", &binding.name, &mut errors);
            if !seen.insert(binding.name.as_str()) {
                errors.push(format!("duplicate binding name '{}'", binding.name));
            }
            if binding.capability_reference.is_empty() {
                errors.push(format!("binding '{}' has an empty capability_reference", binding.name));
            }
            match url::Url::parse(&binding.endpoint) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
                Ok(_) => errors.push(format!(
                    "binding '{}' endpoint '{}' must be an http(s) URL",
                    binding.name, binding.endpoint
                )),
                Err(e) => errors.push(format!(
                    "binding '{}' endpoint '{}' is not a URI: {}",
                    binding.name, binding.endpoint, e
                )),
            }
            if let Err(e) = semver::Version::parse(&binding.interface_version) {
                errors.push(format!(
                    "binding '{}' interface_version '{}' is not semver: {}",
                    binding.name, binding.interface_version, e
                ));
            }
            check_amount(&format!("binding '{}' price_cap", binding.name), binding.price_cap, &mut errors);
        }

        if self.policy_digest.len() != POLICY_DIGEST_LEN * 2
            || !self
                .policy_digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            errors.push(format!(
                "policy_digest must be {} lowercase hex characters",
                POLICY_DIGEST_LEN * 2
            ));
        }

        errors
    }
}

fn deep_merge(base: &mut ParamValue, updates: &ParamValue) {
    match (base, updates) {
        (ParamValue::Object(base), ParamValue::Object(updates)) => {
            for (key, value) in updates {
                let nested = value.is_object() && base.get(key).map_or(false, |v| v.is_object());
                match base.get_mut(key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, updates) => *base = updates.clone(),
    }
}

fn check_name(what: &str, name: &str, errors: &mut Vec<String>) {
    if name.is_empty() {
        errors.push(format!("{} name is empty", what));
    } else if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        errors.push(format!(
            "{} name '{}' may only contain alphanumerics and '_'",
            what, name
        ));
    }
}

fn check_amount(what: &str, value: f64, errors: &mut Vec<String>) {
    if !value.is_finite() {
        errors.push(format!("{} must be finite", what));
    } else if value < 0.0 {
        errors.push(format!("{} must be non-negative, got {}", what, value));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn zero_digest() -> String {
        "0".repeat(64)
    }

    pub(crate) fn sample_genome() -> GenomeModel {
        let mut genome = GenomeModel::minimal("borg-alpha-7", zero_digest());
        genome.units = vec![
            Unit::new("proc", UnitKind::Echo),
            Unit::new("lookup", UnitKind::Relay)
                .with_param("binding", json!("search"))
                .with_param("limits", json!({"max_results": 5, "lang": "en"}))
                .with_cost(0.25),
            Unit::new("survey", UnitKind::Fanout)
                .with_param("bindings", json!(["search", "archive"]))
                .with_cost(1.5),
        ];
        genome.bindings = vec![
            Binding::new("search", "mcp:duckduckgo", "https://tools.example.org/search")
                .with_price_cap(0.01),
            Binding::new("archive", "mcp:arxiv", "http://127.0.0.1:8080/arxiv"),
        ];
        genome
    }

    #[test]
    fn test_sample_is_valid() {
        let genome = sample_genome();
        assert!(genome.validate().is_ok(), "{:?}", genome.validation_errors());
        assert_eq!(genome.unit_names(), vec!["proc", "lookup", "survey"]);
        assert_eq!(genome.binding("archive").unwrap().capability_reference, "mcp:arxiv");
    }

    #[test]
    fn test_duplicate_unit_names_rejected() {
        let mut genome = sample_genome();
        genome.units.push(Unit::new("proc", UnitKind::Echo));
        let err = genome.validate().unwrap_err();
        assert!(matches!(err, GenomeError::MalformedModel(ref m) if m.contains("duplicate unit name 'proc'")));
    }

    #[test]
    fn test_duplicate_binding_names_rejected() {
        let mut genome = sample_genome();
        genome.bindings.push(Binding::new("search", "mcp:google", "https://g.example.org"));
        assert!(genome
            .validation_errors()
            .iter()
            .any(|e| e.contains("duplicate binding name 'search'")));
    }

    #[test]
    fn test_negative_and_non_finite_amounts_rejected() {
        let mut genome = sample_genome();
        genome.units[0].cost_estimate = -1.0;
        genome.bindings[0].price_cap = f64::INFINITY;
        let errors = genome.validation_errors();
        assert!(errors.iter().any(|e| e.contains("non-negative")));
        assert!(errors.iter().any(|e| e.contains("finite")));
    }

    #[test]
    fn test_endpoint_and_version_checks() {
        let mut genome = sample_genome();
        genome.bindings[0].endpoint = "ftp://files.example.org".into();
        genome.bindings[1].endpoint = "not a uri".into();
        genome.bindings[1].interface_version = "v1".into();
        let errors = genome.validation_errors();
        assert!(errors.iter().any(|e| e.contains("must be an http(s) URL")));
        assert!(errors.iter().any(|e| e.contains("is not a URI")));
        assert!(errors.iter().any(|e| e.contains("not semver")));
    }

    #[test]
    fn test_identifier_and_digest_format() {
        let mut genome = GenomeModel::minimal("bad id!", "ABC");
        let errors = genome.validation_errors();
        assert_eq!(errors.len(), 2);
        genome.header.instance_identifier = String::new();
        genome.policy_digest = zero_digest();
        assert!(genome.validation_errors()[0].contains("empty"));
    }

    #[test]
    fn test_merge_updates_nested_fields() {
        let genome = sample_genome();
        let merged = genome
            .merge(&json!({
                "header": {"resource_limit": 42},
                "policy_digest": "ab".repeat(32),
            }))
            .unwrap();
        assert_eq!(merged.header.resource_limit, 42);
        assert_eq!(merged.header.schema_version, genome.header.schema_version);
        assert_eq!(merged.instance_identifier(), "borg-alpha-7");
        assert_eq!(merged.units, genome.units);
        assert_eq!(merged.policy_digest, "ab".repeat(32));

        let same_id = genome
            .merge(&json!({"header": {"instance_identifier": "borg-alpha-7"}, "units": []}))
            .unwrap();
        assert!(same_id.units.is_empty());
        assert_eq!(same_id.bindings, genome.bindings);
    }

    #[test]
    fn test_merge_rejects_identifier_change() {
        let genome = sample_genome();
        let err = genome
            .merge(&json!({"header": {"instance_identifier": "borg-beta-1"}}))
            .unwrap_err();
        assert!(matches!(err, GenomeError::MalformedModel(ref m) if m.contains("immutable")));
    }

    #[test]
    fn test_merge_result_must_validate() {
        let genome = sample_genome();
        assert!(genome.merge(&json!(["not", "a", "mapping"])).is_err());
        assert!(genome.merge(&json!({"header": {"colour": "red"}})).is_err());
        let err = genome.merge(&json!({"policy_digest": "XYZ"})).unwrap_err();
        assert!(matches!(err, GenomeError::MalformedModel(ref m) if m.contains("policy_digest")));
    }

    #[test]
    fn test_unit_kind_tags() {
        for kind in UnitKind::ALL {
            let tag = serde_json::to_string(&kind).unwrap();
            assert_eq!(tag, format!("\"{}\"", kind.tag()));
        }
    }
}
