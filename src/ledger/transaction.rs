//! Ledger transactions carrying a digest as their memo
//!
//! Signing uses ed25519. A signer's address is the hex of its verifying key.
//! Key material comes from a `KeyProvider` by logical name and is never
//! logged or persisted.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why a transaction could not be signed. Never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SigningError {
    #[error("signing key '{0}' is not available")]
    KeyAbsent(String),

    #[error("signing key '{name}' is malformed: {reason}")]
    KeyMalformed { name: String, reason: String },

    #[error("signing key '{name}' signs as {derived}, expected {expected}")]
    AddressMismatch {
        name: String,
        expected: String,
        derived: String,
    },

    #[error("cannot serialize transaction: {0}")]
    Payload(String),
}

/// Raw secret key bytes. Debug output is redacted.
#[derive(Clone)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Fresh random ed25519 secret
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        Self(bytes.to_vec())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s.trim()).map(Self)
    }

    fn signing_key(&self, name: &str) -> Result<SigningKey, SigningError> {
        let bytes: [u8; 32] = self.0.as_slice().try_into().map_err(|_| SigningError::KeyMalformed {
            name: name.to_string(),
            reason: format!("expected 32 bytes, got {}", self.0.len()),
        })?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    /// Address this key signs as
    pub fn address(&self, name: &str) -> Result<String, SigningError> {
        Ok(hex::encode(self.signing_key(name)?.verifying_key().to_bytes()))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Supplies signing keys by logical name
pub trait KeyProvider: Send + Sync {
    fn key(&self, name: &str) -> Result<KeyMaterial, SigningError>;
}

/// Keys held in memory, for tests and the demo
#[derive(Default)]
pub struct StaticKeyProvider {
    keys: HashMap<String, KeyMaterial>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, key: KeyMaterial) {
        self.keys.insert(name.into(), key);
    }

    pub fn with_key(mut self, name: impl Into<String>, key: KeyMaterial) -> Self {
        self.insert(name, key);
        self
    }
}

impl KeyProvider for StaticKeyProvider {
    fn key(&self, name: &str) -> Result<KeyMaterial, SigningError> {
        self.keys
            .get(name)
            .cloned()
            .ok_or_else(|| SigningError::KeyAbsent(name.to_string()))
    }
}

/// Reads hex keys from `GENOME_ANCHOR_KEY_<NAME>` environment variables
pub struct EnvKeyProvider;

impl EnvKeyProvider {
    pub fn variable(name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("GENOME_ANCHOR_KEY_{}", suffix)
    }
}

impl KeyProvider for EnvKeyProvider {
    fn key(&self, name: &str) -> Result<KeyMaterial, SigningError> {
        let raw = std::env::var(Self::variable(name)).map_err(|_| SigningError::KeyAbsent(name.to_string()))?;
        KeyMaterial::from_hex(&raw).map_err(|e| SigningError::KeyMalformed {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A transaction before signing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    /// Expected signer address
    pub sender: String,
    pub nonce: u64,
    pub fee: u64,
    /// Hex digest carried as an opaque remark
    pub memo: String,
    pub instance_identifier: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SigningPayload<'a> {
    sender: &'a str,
    nonce: u64,
    fee: u64,
    memo: &'a str,
    instance_identifier: &'a str,
}

impl UnsignedTransaction {
    /// Bytes covered by the signature
    pub fn signing_payload(&self) -> Result<Vec<u8>, SigningError> {
        serde_json::to_vec(&SigningPayload {
            sender: &self.sender,
            nonce: self.nonce,
            fee: self.fee,
            memo: &self.memo,
            instance_identifier: &self.instance_identifier,
        })
        .map_err(|e| SigningError::Payload(e.to_string()))
    }

    /// Sign with `key`, which must derive the `sender` address
    pub fn sign(self, key_name: &str, key: &KeyMaterial) -> Result<SignedTransaction, SigningError> {
        let signing_key = key.signing_key(key_name)?;
        let derived = hex::encode(signing_key.verifying_key().to_bytes());
        if derived != self.sender {
            return Err(SigningError::AddressMismatch {
                name: key_name.to_string(),
                expected: self.sender.clone(),
                derived,
            });
        }
        let signature = signing_key.sign(&self.signing_payload()?);
        Ok(SignedTransaction {
            signature: hex::encode(signature.to_bytes()),
            public_key: derived,
            transaction: self,
        })
    }
}

/// A transaction ready for submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: UnsignedTransaction,
    pub signature: String,
    pub public_key: String,
}

impl SignedTransaction {
    /// Check the signature against the embedded public key and sender
    pub fn verify(&self) -> bool {
        if self.public_key != self.transaction.sender {
            return false;
        }
        let Ok(pk) = hex::decode(&self.public_key) else { return false };
        let Ok(pk) = <[u8; 32]>::try_from(pk.as_slice()) else { return false };
        let Ok(key) = VerifyingKey::from_bytes(&pk) else { return false };
        let Ok(sig) = hex::decode(&self.signature) else { return false };
        let Ok(sig) = Signature::from_slice(&sig) else { return false };
        match self.transaction.signing_payload() {
            Ok(payload) => key.verify(&payload, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned(sender: String) -> UnsignedTransaction {
        UnsignedTransaction {
            sender,
            nonce: 7,
            fee: 1_200,
            memo: "ab".repeat(32),
            instance_identifier: "unit-test-1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let key = KeyMaterial::generate();
        let address = key.address("anchor").unwrap();
        let signed = unsigned(address.clone()).sign("anchor", &key).unwrap();
        assert_eq!(signed.public_key, address);
        assert!(signed.verify());

        let mut tampered = signed.clone();
        tampered.transaction.fee += 1;
        assert!(!tampered.verify());
    }

    #[test]
    fn test_address_mismatch() {
        let key = KeyMaterial::generate();
        let other = KeyMaterial::generate().address("other").unwrap();
        let err = unsigned(other).sign("anchor", &key).unwrap_err();
        assert!(matches!(err, SigningError::AddressMismatch { .. }));
    }

    #[test]
    fn test_malformed_and_absent_keys() {
        let short = KeyMaterial::new(vec![1, 2, 3]);
        assert!(matches!(short.address("k"), Err(SigningError::KeyMalformed { .. })));
        let provider = StaticKeyProvider::new().with_key("k", short);
        assert!(provider.key("k").is_ok());
        assert_eq!(provider.key("missing").unwrap_err(), SigningError::KeyAbsent("missing".into()));
    }

    #[test]
    fn test_key_material_redacted() {
        let key = KeyMaterial::new(vec![0xaa; 32]);
        let shown = format!("{:?}", key);
        assert!(!shown.contains("aa"));
        assert_eq!(EnvKeyProvider::variable("anchor-main"), "GENOME_ANCHOR_KEY_ANCHOR_MAIN");
    }
}
