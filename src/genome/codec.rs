//! GenomeCodec — YAML wire format with a built-in round-trip guarantee
//!
//! `encode` validates, serializes and digests a genome. `decode` parses,
//! validates, and then re-encodes what it parsed: a decode only succeeds when
//! the re-encoded document digests identically, so nothing that would drift on
//! the next round trip is ever accepted.

use super::hash::{Digest, HashEngine};
use super::model::{GenomeError, GenomeModel};
use log::debug;

/// Top-level keys accepted in a wire document
pub const TOP_LEVEL_KEYS: [&str; 4] = ["header", "units", "bindings", "policy_digest"];

/// Serialized genome bytes (UTF-8 YAML)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBytes(Vec<u8>);

impl WireBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The YAML text, or `None` for bytes that are not UTF-8. Encoder
    /// output is always UTF-8; bytes read from elsewhere may not be.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for WireBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for WireBytes {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

/// Output of `GenomeCodec::encode`
#[derive(Debug, Clone)]
pub struct EncodedGenome {
    pub wire: WireBytes,
    pub digest: Digest,
}

/// Stateless encoder/decoder for genomes
pub struct GenomeCodec;

impl GenomeCodec {
    /// Serialize a genome and compute its digest
    pub fn encode(model: &GenomeModel) -> Result<EncodedGenome, GenomeError> {
        let digest = HashEngine::genome_digest(model)?;
        let yaml = serde_yaml::to_string(model)
            .map_err(|e| GenomeError::malformed(format!("wire serialization failed: {}", e)))?;
        debug!(
            "Encoded genome '{}' ({} bytes, digest {})",
            model.instance_identifier(),
            yaml.len(),
            digest.short()
        );
        Ok(EncodedGenome {
            wire: WireBytes::from(yaml),
            digest,
        })
    }

    /// Parse and fully validate wire bytes
    pub fn decode(wire: &[u8]) -> Result<GenomeModel, GenomeError> {
        Self::decode_with_digest(wire).map(|(model, _)| model)
    }

    /// Decode and return the digest the decoded genome anchors to
    pub fn decode_with_digest(wire: &[u8]) -> Result<(GenomeModel, Digest), GenomeError> {
        let model = Self::parse(wire)?;
        let digest = HashEngine::genome_digest(&model)?;

        let reencoded = Self::encode(&model)?;
        let reparsed = Self::parse(reencoded.wire.as_bytes())?;
        let redigest = HashEngine::genome_digest(&reparsed)?;
        if redigest != digest || reencoded.digest != digest {
            return Err(GenomeError::decode(format!(
                "round trip changed the digest ({} -> {})",
                digest, redigest
            )));
        }
        Ok((model, digest))
    }

    /// Digest of whatever genome the wire bytes describe
    pub fn digest_wire(wire: &[u8]) -> Result<Digest, GenomeError> {
        Self::decode_with_digest(wire).map(|(_, digest)| digest)
    }

    /// Encode → decode → compare digests
    pub fn verify_round_trip(model: &GenomeModel) -> Result<Digest, GenomeError> {
        let encoded = Self::encode(model)?;
        let (decoded, digest) = Self::decode_with_digest(encoded.wire.as_bytes())?;
        if digest != encoded.digest || &decoded != model {
            return Err(GenomeError::decode(format!(
                "genome '{}' does not survive a round trip",
                model.instance_identifier()
            )));
        }
        Ok(digest)
    }

    fn parse(wire: &[u8]) -> Result<GenomeModel, GenomeError> {
        let text = std::str::from_utf8(wire)
            .map_err(|e| GenomeError::decode(format!("wire bytes are not UTF-8: {}", e)))?;
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| GenomeError::decode(format!("invalid YAML: {}", e)))?;

        let root = value
            .as_mapping()
            .ok_or_else(|| GenomeError::decode("document root must be a mapping"))?;
        for key in root.keys() {
            match key.as_str() {
                Some(k) if TOP_LEVEL_KEYS.contains(&k) => {}
                Some(k) => return Err(GenomeError::decode(format!("unknown top-level key '{}'", k))),
                None => return Err(GenomeError::decode("top-level keys must be strings")),
            }
        }
        check_portable(&value, "$")?;

        let model: GenomeModel = serde_yaml::from_value(value)
            .map_err(|e| GenomeError::decode(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }
}

/// Reject YAML constructs that cannot be carried through the model losslessly
fn check_portable(value: &serde_yaml::Value, path: &str) -> Result<(), GenomeError> {
    match value {
        serde_yaml::Value::Number(n) => {
            if n.as_f64().map_or(false, |f| !f.is_finite()) {
                return Err(GenomeError::decode(format!("non-finite number at {}", path)));
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for (i, item) in items.iter().enumerate() {
                check_portable(item, &format!("{}[{}]", path, i))?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let key = k
                    .as_str()
                    .ok_or_else(|| GenomeError::decode(format!("non-string key under {}", path)))?;
                check_portable(v, &format!("{}.{}", path, key))?;
            }
        }
        serde_yaml::Value::Tagged(_) => {
            return Err(GenomeError::decode(format!("YAML tags are not supported at {}", path)));
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::model::tests::{sample_genome, zero_digest};
    use crate::genome::model::{Unit, UnitKind};

    fn scenario_genome() -> GenomeModel {
        let mut genome = GenomeModel::minimal("unit-test-1", zero_digest());
        genome.header.resource_limit = 1_000_000;
        genome.units.push(Unit::new("proc", UnitKind::Echo));
        genome
    }

    #[test]
    fn test_scenario_round_trip() {
        let genome = scenario_genome();
        let first = GenomeCodec::encode(&genome).unwrap();
        let decoded = GenomeCodec::decode(first.wire.as_bytes()).unwrap();
        assert_eq!(decoded, genome);
        let second = GenomeCodec::encode(&decoded).unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.wire, second.wire);
    }

    #[test]
    fn test_encode_digest_matches_wire_digest() {
        let genome = sample_genome();
        let encoded = GenomeCodec::encode(&genome).unwrap();
        assert_eq!(GenomeCodec::digest_wire(encoded.wire.as_bytes()).unwrap(), encoded.digest);
        assert_eq!(GenomeCodec::verify_round_trip(&genome).unwrap(), encoded.digest);
    }

    #[test]
    fn test_hand_written_document() {
        let wire = format!(
            r#"
header:
  schema_version: 1
  resource_limit: 1000000
  instance_identifier: unit-test-1
units:
  - name: proc
    kind: echo
    parameters: {{}}
    cost_estimate: 0
bindings: []
policy_digest: "{}"
"#,
            zero_digest()
        );
        let decoded = GenomeCodec::decode(wire.as_bytes()).unwrap();
        assert_eq!(decoded, scenario_genome());
        assert_eq!(
            GenomeCodec::digest_wire(wire.as_bytes()).unwrap(),
            GenomeCodec::encode(&scenario_genome()).unwrap().digest
        );
    }

    #[test]
    fn test_duplicate_unit_names_fail_as_malformed() {
        let mut genome = scenario_genome();
        let mut wire = GenomeCodec::encode(&genome).unwrap().wire.as_str().unwrap().to_string();
        genome.units.push(Unit::new("proc", UnitKind::Echo));
        // Encoder refuses the duplicate, so write the document directly
        wire = wire.replace(
            "units:\n",
            "units:\n- name: proc\n  kind: echo\n  parameters: {}\n  cost_estimate: 0.0\n",
        );
        assert!(matches!(
            GenomeCodec::decode(wire.as_bytes()),
            Err(GenomeError::MalformedModel(_))
        ));
        assert!(GenomeCodec::encode(&genome).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let wire = GenomeCodec::encode(&scenario_genome())
            .unwrap()
            .wire
            .as_str()
            .unwrap()
            .replace("kind: echo", "kind: teleport");
        let err = GenomeCodec::decode(wire.as_bytes()).unwrap_err();
        assert!(matches!(err, GenomeError::DecodeError { ref reason } if reason.contains("teleport")));
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let mut wire = GenomeCodec::encode(&scenario_genome()).unwrap().wire.as_str().unwrap().to_string();
        wire.push_str("reputation:\n  average_rating: 4.5\n");
        let err = GenomeCodec::decode(wire.as_bytes()).unwrap_err();
        assert!(matches!(err, GenomeError::DecodeError { ref reason } if reason.contains("reputation")));
    }

    #[test]
    fn test_non_finite_and_garbage_rejected() {
        let wire = GenomeCodec::encode(&scenario_genome())
            .unwrap()
            .wire
            .as_str()
            .unwrap()
            .replace("parameters: {}", "parameters:\n    gain: .nan");
        assert!(matches!(
            GenomeCodec::decode(wire.as_bytes()),
            Err(GenomeError::DecodeError { .. })
        ));
        assert!(GenomeCodec::decode(b"- just\n- a list\n").is_err());
        assert!(GenomeCodec::decode(&[0xff, 0xfe, 0x00]).is_err());
        assert_eq!(WireBytes::from(vec![0xff, 0xfe, 0x00]).as_str(), None);
    }

    #[test]
    fn test_missing_policy_digest_rejected() {
        let wire = "header:\n  schema_version: 1\n  resource_limit: 5\n  instance_identifier: x\n";
        assert!(matches!(
            GenomeCodec::decode(wire.as_bytes()),
            Err(GenomeError::DecodeError { .. })
        ));
    }
}
