//! LedgerNode — the remote node the lifecycle manager talks to
//!
//! The ledger itself is opaque: the manager only needs fee estimates, nonces,
//! submission and inclusion polling. `SimulatedNode` is an in-process ledger
//! with scriptable faults for tests and the demo.

use super::transaction::SignedTransaction;
use crate::resilience::Retryable;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Identifier the node assigns to a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the node knows about a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InclusionStatus {
    /// Not known to the node
    Unknown,
    /// Accepted but not in a block yet
    InMempool,
    Included { block: u64 },
    /// Dropped or invalidated; will never be included
    Dropped { reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error("node unreachable: {0}")]
    Network(String),

    #[error("fee estimation failed: {0}")]
    FeeEstimation(String),

    #[error("transaction rejected: {reason}")]
    Rejected { reason: String },
}

impl Retryable for NodeError {
    fn is_retryable(&self) -> bool {
        !matches!(self, NodeError::Rejected { .. })
    }
}

#[async_trait]
pub trait LedgerNode: Send + Sync {
    /// Endpoint used to key the node's circuit breaker
    fn endpoint(&self) -> &str;

    async fn estimate_fee(&self, memo_len: usize) -> Result<u64, NodeError>;

    async fn next_nonce(&self, address: &str) -> Result<u64, NodeError>;

    async fn submit(&self, transaction: &SignedTransaction) -> Result<TransactionId, NodeError>;

    async fn inclusion(&self, id: &TransactionId) -> Result<InclusionStatus, NodeError>;

    /// Current head block height
    async fn head(&self) -> Result<u64, NodeError>;
}

struct Submitted {
    include_at: Option<u64>,
    dropped: Option<String>,
}

struct SimState {
    head: u64,
    blocks_per_poll: u64,
    include_after: Option<u64>,
    base_fee: u64,
    fee_per_byte: u64,
    unreachable: bool,
    fee_failures: u32,
    submit_failures: u32,
    reject_next: Option<String>,
    drop_next: Option<String>,
    nonces: HashMap<String, u64>,
    transactions: HashMap<TransactionId, Submitted>,
    fee_queries: u32,
    submissions: u32,
}

/// In-process ledger node
pub struct SimulatedNode {
    endpoint: String,
    state: Mutex<SimState>,
}

impl SimulatedNode {
    /// Head starts at block 100, advances one block per head query and
    /// includes transactions in the next block.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(SimState {
                head: 100,
                blocks_per_poll: 1,
                include_after: Some(1),
                base_fee: 1_000,
                fee_per_byte: 10,
                unreachable: false,
                fee_failures: 0,
                submit_failures: 0,
                reject_next: None,
                drop_next: None,
                nonces: HashMap::new(),
                transactions: HashMap::new(),
                fee_queries: 0,
                submissions: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks after submission before inclusion; `None` never includes
    pub fn include_after(&self, blocks: Option<u64>) {
        self.state().include_after = blocks;
    }

    pub fn blocks_per_poll(&self, blocks: u64) {
        self.state().blocks_per_poll = blocks;
    }

    pub fn advance(&self, blocks: u64) {
        self.state().head += blocks;
    }

    pub fn fail_fee_estimates(&self, times: u32) {
        self.state().fee_failures = times;
    }

    pub fn fail_submissions(&self, times: u32) {
        self.state().submit_failures = times;
    }

    pub fn reject_next(&self, reason: impl Into<String>) {
        self.state().reject_next = Some(reason.into());
    }

    pub fn drop_next(&self, reason: impl Into<String>) {
        self.state().drop_next = Some(reason.into());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn fee_queries(&self) -> u32 {
        self.state().fee_queries
    }

    pub fn submissions(&self) -> u32 {
        self.state().submissions
    }

    fn reachable(&self, state: &SimState) -> Result<(), NodeError> {
        if state.unreachable {
            return Err(NodeError::Network(format!("{} is not answering", self.endpoint)));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerNode for SimulatedNode {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn estimate_fee(&self, memo_len: usize) -> Result<u64, NodeError> {
        let mut state = self.state();
        state.fee_queries += 1;
        self.reachable(&state)?;
        if state.fee_failures > 0 {
            state.fee_failures -= 1;
            return Err(NodeError::FeeEstimation("fee oracle busy".to_string()));
        }
        Ok(state.base_fee + state.fee_per_byte * memo_len as u64)
    }

    async fn next_nonce(&self, address: &str) -> Result<u64, NodeError> {
        let state = self.state();
        self.reachable(&state)?;
        Ok(state.nonces.get(address).copied().unwrap_or(0))
    }

    async fn submit(&self, transaction: &SignedTransaction) -> Result<TransactionId, NodeError> {
        let mut state = self.state();
        state.submissions += 1;
        self.reachable(&state)?;
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(NodeError::Network("connection reset".to_string()));
        }
        if let Some(reason) = state.reject_next.take() {
            return Err(NodeError::Rejected { reason });
        }
        if !transaction.verify() {
            return Err(NodeError::Rejected {
                reason: "invalid signature".to_string(),
            });
        }
        let sender = &transaction.transaction.sender;
        let expected = state.nonces.get(sender).copied().unwrap_or(0);
        if transaction.transaction.nonce != expected {
            return Err(NodeError::Rejected {
                reason: format!(
                    "invalid nonce: expected {}, got {}",
                    expected, transaction.transaction.nonce
                ),
            });
        }
        state.nonces.insert(sender.clone(), expected + 1);

        let id = TransactionId(uuid::Uuid::new_v4().to_string());
        let submitted = Submitted {
            include_at: state.include_after.map(|blocks| state.head + blocks),
            dropped: state.drop_next.take(),
        };
        state.transactions.insert(id.clone(), submitted);
        debug!("Simulated node accepted {} at head {}", id, state.head);
        Ok(id)
    }

    async fn inclusion(&self, id: &TransactionId) -> Result<InclusionStatus, NodeError> {
        let state = self.state();
        self.reachable(&state)?;
        let status = match state.transactions.get(id) {
            None => InclusionStatus::Unknown,
            Some(Submitted {
                dropped: Some(reason),
                ..
            }) => InclusionStatus::Dropped {
                reason: reason.clone(),
            },
            Some(Submitted {
                include_at: Some(block),
                ..
            }) if *block <= state.head => InclusionStatus::Included { block: *block },
            Some(_) => InclusionStatus::InMempool,
        };
        Ok(status)
    }

    async fn head(&self) -> Result<u64, NodeError> {
        let mut state = self.state();
        self.reachable(&state)?;
        state.head += state.blocks_per_poll;
        Ok(state.head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::transaction::{KeyMaterial, UnsignedTransaction};
    use chrono::Utc;

    fn signed(key: &KeyMaterial, nonce: u64) -> SignedTransaction {
        UnsignedTransaction {
            sender: key.address("k").unwrap(),
            nonce,
            fee: 1_000,
            memo: "00".repeat(32),
            instance_identifier: "sim".into(),
            created_at: Utc::now(),
        }
        .sign("k", key)
        .unwrap()
    }

    #[tokio::test]
    async fn test_inclusion_follows_head() {
        let node = SimulatedNode::new("sim://local");
        let key = KeyMaterial::generate();
        let id = node.submit(&signed(&key, 0)).await.unwrap();
        assert_eq!(node.inclusion(&id).await.unwrap(), InclusionStatus::InMempool);
        assert_eq!(node.head().await.unwrap(), 101);
        assert_eq!(node.inclusion(&id).await.unwrap(), InclusionStatus::Included { block: 101 });
        let unknown = TransactionId("nope".into());
        assert_eq!(node.inclusion(&unknown).await.unwrap(), InclusionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_nonce_enforced() {
        let node = SimulatedNode::new("sim://local");
        let key = KeyMaterial::generate();
        node.submit(&signed(&key, 0)).await.unwrap();
        let err = node.submit(&signed(&key, 0)).await.unwrap_err();
        assert!(matches!(err, NodeError::Rejected { ref reason } if reason.contains("nonce")));
        assert!(!err.is_retryable());
        assert_eq!(node.next_nonce(&key.address("k").unwrap()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let node = SimulatedNode::new("sim://local");
        node.fail_fee_estimates(1);
        let err = node.estimate_fee(64).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(node.estimate_fee(64).await.unwrap(), 1_640);

        node.set_unreachable(true);
        assert!(matches!(node.head().await, Err(NodeError::Network(_))));
        node.set_unreachable(false);

        let key = KeyMaterial::generate();
        node.drop_next("evicted");
        let id = node.submit(&signed(&key, 0)).await.unwrap();
        assert_eq!(
            node.inclusion(&id).await.unwrap(),
            InclusionStatus::Dropped { reason: "evicted".into() }
        );
    }
}
