//! AnchorRecord — one anchoring attempt and its confirmation state machine
//!
//! ```text
//! Constructed → Signed → Submitted → Pending ⟲ → Confirmed | Failed | TimedOut
//! ```
//! Any non-terminal state may fail. Terminal records are sealed.

use super::node::TransactionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    Constructed,
    Signed,
    Submitted,
    Pending,
    Confirmed,
    Failed,
    TimedOut,
}

impl AnchorStatus {
    pub const ALL: [AnchorStatus; 7] = [
        AnchorStatus::Constructed,
        AnchorStatus::Signed,
        AnchorStatus::Submitted,
        AnchorStatus::Pending,
        AnchorStatus::Confirmed,
        AnchorStatus::Failed,
        AnchorStatus::TimedOut,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnchorStatus::Confirmed | AnchorStatus::Failed | AnchorStatus::TimedOut)
    }

    pub fn can_transition_to(&self, next: AnchorStatus) -> bool {
        use AnchorStatus::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed) => true,
            (Constructed, Signed) => true,
            (Signed, Submitted) => true,
            (Submitted, Pending) | (Submitted, TimedOut) => true,
            (Pending, Pending) | (Pending, Confirmed) | (Pending, TimedOut) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnchorStatus::Constructed => "constructed",
            AnchorStatus::Signed => "signed",
            AnchorStatus::Submitted => "submitted",
            AnchorStatus::Pending => "pending",
            AnchorStatus::Confirmed => "confirmed",
            AnchorStatus::Failed => "failed",
            AnchorStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("anchor record {id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: Uuid,
    pub from: AnchorStatus,
    pub to: AnchorStatus,
}

/// One anchoring attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub id: Uuid,
    #[serde(serialize_with = "digest_to_hex", deserialize_with = "digest_from_hex")]
    pub digest: Vec<u8>,
    pub instance_identifier: String,
    pub transaction_id: Option<TransactionId>,
    pub status: AnchorStatus,
    /// Block the transaction was included in
    pub block_reference: Option<u64>,
    pub confirmation_depth: u64,
    pub fee: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Submission attempts, retries included
    pub attempt_count: u32,
    /// Human-readable outcome; set on every terminal record
    pub reason: Option<String>,
}

impl AnchorRecord {
    pub fn new(digest: &[u8], instance_identifier: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            digest: digest.to_vec(),
            instance_identifier: instance_identifier.into(),
            transaction_id: None,
            status: AnchorStatus::Constructed,
            block_reference: None,
            confirmation_depth: 0,
            fee: None,
            created_at: Utc::now(),
            submitted_at: None,
            last_checked_at: None,
            attempt_count: 0,
            reason: None,
        }
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a non-terminal state
    pub fn advance(&mut self, next: AnchorStatus) -> Result<(), TransitionError> {
        self.check(next)?;
        if next == AnchorStatus::Submitted {
            self.submitted_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Move to a terminal state with the reason shown to the caller
    pub fn finish(&mut self, next: AnchorStatus, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.check(next)?;
        self.status = next;
        self.reason = Some(reason.into());
        Ok(())
    }

    fn check(&self, next: AnchorStatus) -> Result<(), TransitionError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(TransitionError {
                id: self.id,
                from: self.status,
                to: next,
            })
        }
    }

    /// Time from submission to the final check, for confirmed records
    pub fn confirmation_latency(&self) -> Option<chrono::Duration> {
        if self.status != AnchorStatus::Confirmed {
            return None;
        }
        Some(self.last_checked_at? - self.submitted_at?)
    }
}

fn digest_to_hex<S: Serializer>(digest: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(digest))
}

fn digest_from_hex<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    hex::decode(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut record = AnchorRecord::new(&[7u8; 32], "unit-test-1");
        record.advance(AnchorStatus::Signed).unwrap();
        record.advance(AnchorStatus::Submitted).unwrap();
        assert!(record.submitted_at.is_some());
        record.advance(AnchorStatus::Pending).unwrap();
        record.advance(AnchorStatus::Pending).unwrap();
        record.last_checked_at = Some(Utc::now());
        record.finish(AnchorStatus::Confirmed, "confirmed at depth 6").unwrap();
        assert!(record.is_terminal());
        assert!(record.confirmation_latency().is_some());
    }

    #[test]
    fn test_terminal_records_are_sealed() {
        let mut record = AnchorRecord::new(&[1u8; 32], "x");
        record.finish(AnchorStatus::Failed, "signing key absent").unwrap();
        for status in AnchorStatus::ALL {
            assert!(record.advance(status).is_err());
        }
        assert_eq!(record.reason.as_deref(), Some("signing key absent"));
    }

    #[test]
    fn test_skipping_states_rejected() {
        let mut record = AnchorRecord::new(&[1u8; 32], "x");
        assert!(record.advance(AnchorStatus::Pending).is_err());
        assert!(record.finish(AnchorStatus::Confirmed, "too early").is_err());
        assert!(!AnchorStatus::Signed.can_transition_to(AnchorStatus::TimedOut));
        assert!(AnchorStatus::Submitted.can_transition_to(AnchorStatus::TimedOut));
    }

    #[test]
    fn test_record_json_uses_hex_digest() {
        let record = AnchorRecord::new(&[0xab; 4], "x");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["digest"], "abababab");
        assert_eq!(json["status"], "constructed");
        let back: AnchorRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
