//! HashEngine — canonical serialization and SHA-256 digests of genomes
//!
//! Canonical form is compact JSON with struct fields in declaration order,
//! parameter maps sorted by key and unit/binding sequences in their declared
//! order, prefixed by a version tag. Two semantically equal genomes always
//! canonicalize to the same bytes.

use super::model::{GenomeError, GenomeModel, ParamValue};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;

/// Prefix binding canonical bytes to this encoding version
pub const CANONICAL_TAG: &[u8] = b"genome-canonical-v1\n";

/// A fixed-length (256-bit) genome digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    /// First 8 bytes as hex, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize)]
struct CanonicalHeader<'a> {
    schema_version: u32,
    resource_limit: u64,
    instance_identifier: &'a str,
}

#[derive(Serialize)]
struct CanonicalUnit<'a> {
    name: &'a str,
    kind: &'static str,
    parameters: BTreeMap<&'a str, ParamValue>,
    cost_estimate: f64,
}

#[derive(Serialize)]
struct CanonicalBinding<'a> {
    name: &'a str,
    capability_reference: &'a str,
    endpoint: &'a str,
    interface_version: &'a str,
    price_cap: f64,
}

#[derive(Serialize)]
struct CanonicalGenome<'a> {
    header: CanonicalHeader<'a>,
    units: Vec<CanonicalUnit<'a>>,
    bindings: Vec<CanonicalBinding<'a>>,
    policy_digest: &'a str,
}

/// Deterministic canonicalization and hashing of genomes
pub struct HashEngine;

impl HashEngine {
    /// Produce the canonical byte form of a validated genome
    pub fn canonicalize(model: &GenomeModel) -> Result<Vec<u8>, GenomeError> {
        model.validate()?;

        let canonical = CanonicalGenome {
            header: CanonicalHeader {
                schema_version: model.header.schema_version,
                resource_limit: model.header.resource_limit,
                instance_identifier: &model.header.instance_identifier,
            },
            units: model
                .units
                .iter()
                .map(|u| CanonicalUnit {
                    name: &u.name,
                    kind: u.kind.tag(),
                    parameters: u
                        .parameters
                        .iter()
                        .map(|(k, v)| (k.as_str(), normalize_value(v)))
                        .collect(),
                    cost_estimate: normalize_zero(u.cost_estimate),
                })
                .collect(),
            bindings: model
                .bindings
                .iter()
                .map(|b| CanonicalBinding {
                    name: &b.name,
                    capability_reference: &b.capability_reference,
                    endpoint: &b.endpoint,
                    interface_version: &b.interface_version,
                    price_cap: normalize_zero(b.price_cap),
                })
                .collect(),
            policy_digest: &model.policy_digest,
        };

        let body = serde_json::to_vec(&canonical)
            .map_err(|e| GenomeError::malformed(format!("canonical serialization failed: {}", e)))?;
        let mut bytes = Vec::with_capacity(CANONICAL_TAG.len() + body.len());
        bytes.extend_from_slice(CANONICAL_TAG);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// SHA-256 over arbitrary bytes
    pub fn digest(bytes: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Digest(out)
    }

    /// `digest(canonicalize(model))`
    pub fn genome_digest(model: &GenomeModel) -> Result<Digest, GenomeError> {
        Ok(Self::digest(&Self::canonicalize(model)?))
    }
}

// -0.0 and 0.0 are the same amount
fn normalize_zero(x: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x
    }
}

fn normalize_value(value: &ParamValue) -> ParamValue {
    match value {
        ParamValue::Number(n) if n.is_f64() => n
            .as_f64()
            .and_then(|f| serde_json::Number::from_f64(normalize_zero(f)))
            .map(ParamValue::Number)
            .unwrap_or(ParamValue::Null),
        ParamValue::Array(items) => ParamValue::Array(items.iter().map(normalize_value).collect()),
        ParamValue::Object(map) => ParamValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::model::tests::sample_genome;
    use crate::genome::model::{Unit, UnitKind};
    use serde_json::json;

    #[test]
    fn test_canonical_is_deterministic() {
        let genome = sample_genome();
        let a = HashEngine::canonicalize(&genome).unwrap();
        let b = HashEngine::canonicalize(&genome.clone()).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(CANONICAL_TAG));
    }

    #[test]
    fn test_map_insertion_order_irrelevant() {
        let mut a = sample_genome();
        let mut b = sample_genome();
        a.units[0] = Unit::new("proc", UnitKind::Echo)
            .with_param("alpha", json!(1))
            .with_param("beta", json!({"y": 2, "x": 1}));
        b.units[0] = Unit::new("proc", UnitKind::Echo)
            .with_param("beta", json!({"x": 1, "y": 2}))
            .with_param("alpha", json!(1));
        assert_eq!(
            HashEngine::genome_digest(&a).unwrap(),
            HashEngine::genome_digest(&b).unwrap()
        );
    }

    #[test]
    fn test_sequence_order_significant() {
        let a = sample_genome();
        let mut b = sample_genome();
        b.units.swap(0, 1);
        assert_ne!(
            HashEngine::genome_digest(&a).unwrap(),
            HashEngine::genome_digest(&b).unwrap()
        );
        let mut c = sample_genome();
        c.bindings.reverse();
        assert_ne!(
            HashEngine::genome_digest(&a).unwrap(),
            HashEngine::genome_digest(&c).unwrap()
        );
    }

    #[test]
    fn test_negative_zero_normalized() {
        let a = sample_genome();
        let mut b = sample_genome();
        b.units[0].cost_estimate = -0.0;
        assert_eq!(
            HashEngine::genome_digest(&a).unwrap(),
            HashEngine::genome_digest(&b).unwrap()
        );
    }

    #[test]
    fn test_malformed_model_fails() {
        let mut genome = sample_genome();
        genome.header.instance_identifier.clear();
        assert!(matches!(
            HashEngine::canonicalize(&genome),
            Err(GenomeError::MalformedModel(_))
        ));
    }

    #[test]
    fn test_digest_hex_roundtrip() {
        let d = HashEngine::digest(b"genome");
        assert_eq!(d.to_hex().len(), 64);
        assert_eq!(Digest::from_hex(&d.to_hex()).unwrap(), d);
        assert_eq!(d.short().len(), 16);
        assert!(Digest::from_hex("abc").is_err());
    }
}
