//! TransactionLifecycleManager — construct, sign, submit and track anchors
//!
//! Fee estimation, nonce queries and submission run through the shared
//! `RetryPolicy` and the node endpoint's circuit breaker. Signing never
//! retries. Construction through submission is serialized per
//! `instance_identifier`, and per signer address since every instance draws
//! nonces from the same account.

use super::node::{InclusionStatus, LedgerNode, NodeError, TransactionId};
use super::record::{AnchorRecord, AnchorStatus, TransitionError};
use super::transaction::{KeyProvider, SignedTransaction, SigningError, UnsignedTransaction};
use crate::config::AnchorConfig;
use crate::resilience::{BreakerRegistry, CircuitBreaker, CircuitOpen, RetryPolicy, Retryable};
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    #[error("fee estimation failed: {0}")]
    FeeEstimation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("transaction rejected: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("unknown anchor record {0}")]
    UnknownRecord(Uuid),
}

impl From<NodeError> for AnchorError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Network(msg) => AnchorError::Network(msg),
            NodeError::FeeEstimation(msg) => AnchorError::FeeEstimation(msg),
            NodeError::Rejected { reason } => AnchorError::Rejected { reason },
        }
    }
}

impl Retryable for AnchorError {
    fn is_retryable(&self) -> bool {
        matches!(self, AnchorError::FeeEstimation(_) | AnchorError::Network(_))
    }
}

/// The node a manager call talks to, with the breaker for its endpoint.
/// Passed explicitly to every call; there is no ambient connection.
#[derive(Clone)]
pub struct LedgerContext {
    node: Arc<dyn LedgerNode>,
    breaker: Arc<CircuitBreaker>,
}

impl LedgerContext {
    pub fn new(node: Arc<dyn LedgerNode>, breakers: &BreakerRegistry) -> Self {
        let breaker = breakers.for_endpoint(node.endpoint());
        Self { node, breaker }
    }

    pub fn endpoint(&self) -> &str {
        self.node.endpoint()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// Which key signs, and the address it must derive
#[derive(Debug, Clone)]
pub struct SignerIdentity {
    pub key_name: String,
    pub address: String,
}

impl SignerIdentity {
    pub fn new(key_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            address: address.into(),
        }
    }

    /// Identity whose address is derived from the provider's current key
    pub fn from_provider(key_name: &str, keys: &dyn KeyProvider) -> Result<Self, SigningError> {
        let address = keys.key(key_name)?.address(key_name)?;
        Ok(Self::new(key_name, address))
    }
}

/// Result of tracking a transaction to a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    pub status: AnchorStatus,
    pub block_reference: Option<u64>,
    pub confirmation_depth: u64,
    pub polls: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_records: usize,
    pub by_status: BTreeMap<AnchorStatus, usize>,
    pub retries_performed: u64,
    pub mean_confirmation_latency_ms: Option<f64>,
}

/// Async locks created on demand per key and dropped once nobody holds or
/// waits on them.
#[derive(Default)]
struct LockTable {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.table()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Give back a handle from `get`, pruning the entry if it was the last one
    fn release(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut table = self.table();
        if table.get(key).map_or(false, |l| Arc::strong_count(l) == 1) {
            table.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

pub struct TransactionLifecycleManager {
    config: AnchorConfig,
    retry: RetryPolicy,
    keys: Arc<dyn KeyProvider>,
    signer: SignerIdentity,
    records: Mutex<Vec<AnchorRecord>>,
    instance_locks: LockTable,
    signer_locks: LockTable,
}

impl TransactionLifecycleManager {
    pub fn new(config: AnchorConfig, keys: Arc<dyn KeyProvider>, signer: SignerIdentity) -> Self {
        let retry = RetryPolicy::new(config.retry_config());
        Self {
            config,
            retry,
            keys,
            signer,
            records: Mutex::new(Vec::new()),
            instance_locks: LockTable::default(),
            signer_locks: LockTable::default(),
        }
    }

    pub fn config(&self) -> &AnchorConfig {
        &self.config
    }

    pub fn signer(&self) -> &SignerIdentity {
        &self.signer
    }

    /// Retries performed by fee estimation, nonce queries and submission
    pub fn retries_performed(&self) -> u64 {
        self.retry.retries_performed()
    }

    /// Build an unsigned transaction carrying `digest` as its memo
    pub async fn construct(
        &self,
        ctx: &LedgerContext,
        digest: &[u8],
        instance_identifier: &str,
    ) -> Result<UnsignedTransaction, AnchorError> {
        let memo = hex::encode(digest);
        let memo_len = memo.len();
        let fee = self
            .retry
            .run("fee estimation", &ctx.breaker, || async {
                ctx.node.estimate_fee(memo_len).await.map_err(AnchorError::from)
            })
            .await?;
        let nonce = self
            .retry
            .run("nonce query", &ctx.breaker, || async {
                ctx.node.next_nonce(&self.signer.address).await.map_err(AnchorError::from)
            })
            .await?;
        Ok(UnsignedTransaction {
            sender: self.signer.address.clone(),
            nonce,
            fee,
            memo,
            instance_identifier: instance_identifier.to_string(),
            created_at: Utc::now(),
        })
    }

    pub fn sign(&self, transaction: UnsignedTransaction) -> Result<SignedTransaction, AnchorError> {
        let key = self.keys.key(&self.signer.key_name)?;
        Ok(transaction.sign(&self.signer.key_name, &key)?)
    }

    pub async fn submit(&self, ctx: &LedgerContext, signed: &SignedTransaction) -> Result<TransactionId, AnchorError> {
        self.submit_counted(ctx, signed).await.0
    }

    async fn submit_counted(
        &self,
        ctx: &LedgerContext,
        signed: &SignedTransaction,
    ) -> (Result<TransactionId, AnchorError>, u32) {
        let attempts = AtomicU32::new(0);
        let result = self
            .retry
            .run("submission", &ctx.breaker, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                ctx.node.submit(signed).await.map_err(AnchorError::from)
            })
            .await;
        (result, attempts.load(Ordering::SeqCst))
    }

    /// Poll until the transaction is final, dropped, or the wall-clock bound
    /// (or the earlier caller `deadline`) passes. Stopping at a deadline only
    /// ends local tracking. The manager's record for `id`, if any, follows
    /// every poll.
    pub async fn track(
        &self,
        ctx: &LedgerContext,
        id: &TransactionId,
        deadline: Option<Instant>,
    ) -> Result<TrackOutcome, AnchorError> {
        let bound = Instant::now() + self.config.timeout();
        let cancelled = deadline.map_or(false, |d| d < bound);
        let stop_at = deadline.map_or(bound, |d| d.min(bound));
        let threshold = self.config.finality_threshold;

        let mut polls = 0u32;
        let mut block = None;
        let mut depth = 0u64;
        loop {
            polls += 1;
            let observed = self.poll(ctx, id).await;
            let dropped = match observed {
                Ok((InclusionStatus::Included { block: b }, head)) => {
                    block = Some(b);
                    depth = head.saturating_sub(b);
                    None
                }
                Ok((InclusionStatus::Dropped { reason }, _)) => Some(reason),
                Ok(_) => None,
                Err(e) => {
                    warn!("Poll {} for {} failed: {}", polls, id, e);
                    None
                }
            };
            self.update_by_transaction(id, |r| {
                r.advance(AnchorStatus::Pending)?;
                r.block_reference = block;
                r.confirmation_depth = depth;
                r.last_checked_at = Some(Utc::now());
                Ok(())
            })?;

            let verdict = if let Some(reason) = dropped {
                Some((AnchorStatus::Failed, format!("dropped by node: {}", reason)))
            } else if let Some(b) = block.filter(|_| depth >= threshold) {
                Some((
                    AnchorStatus::Confirmed,
                    format!("confirmed in block {} at depth {}", b, depth),
                ))
            } else if Instant::now() >= stop_at {
                let reason = match block {
                    _ if cancelled => format!("tracking cancelled at caller deadline after {} polls", polls),
                    None => format!("not included within {}s", self.config.timeout_seconds),
                    Some(b) => format!(
                        "included in block {} but reached depth {} of {} within {}s",
                        b, depth, threshold, self.config.timeout_seconds
                    ),
                };
                Some((AnchorStatus::TimedOut, reason))
            } else {
                None
            };

            if let Some((status, reason)) = verdict {
                self.update_by_transaction(id, |r| r.finish(status, reason.clone()))?;
                info!("Transaction {} {}: {}", id, status, reason);
                return Ok(TrackOutcome {
                    status,
                    block_reference: block,
                    confirmation_depth: depth,
                    polls,
                    reason,
                });
            }

            let remaining = stop_at.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.poll_interval().min(remaining)).await;
        }
    }

    async fn poll(&self, ctx: &LedgerContext, id: &TransactionId) -> Result<(InclusionStatus, u64), AnchorError> {
        let permit = ctx.breaker.try_acquire()?;
        let observed = async {
            let head = ctx.node.head().await?;
            let status = ctx.node.inclusion(id).await?;
            Ok::<_, NodeError>((status, head))
        }
        .await;
        match observed {
            Ok(v) => {
                permit.success();
                Ok(v)
            }
            Err(e) => {
                permit.failure();
                Err(e.into())
            }
        }
    }

    /// Full lifecycle for one digest. Every attempt gets its own record,
    /// even for a digest already anchored for this instance. Failures before
    /// tracking are returned as errors after the record is marked failed.
    pub async fn anchor(
        &self,
        ctx: &LedgerContext,
        digest: &[u8],
        instance_identifier: &str,
        deadline: Option<Instant>,
    ) -> Result<AnchorRecord, AnchorError> {
        let record = AnchorRecord::new(digest, instance_identifier);
        let record_id = record.id;
        self.lock_records().push(record);
        info!(
            "Anchoring {} for {} (record {})",
            hex::encode(digest),
            instance_identifier,
            record_id
        );

        // Instance first, then signer; always in this order.
        let instance_lock = self.instance_locks.get(instance_identifier);
        let signer_lock = self.signer_locks.get(&self.signer.address);
        let submitted = {
            let _instance = instance_lock.lock().await;
            let _signer = signer_lock.lock().await;
            self.prepare_and_submit(ctx, record_id, digest, instance_identifier).await
        };
        self.instance_locks.release(instance_identifier, instance_lock);
        self.signer_locks.release(&self.signer.address, signer_lock);
        let tx_id = match submitted {
            Ok(tx_id) => tx_id,
            Err(e) => {
                warn!("Anchor {} failed: {}", record_id, e);
                if let Err(t) = self.update(record_id, |r| r.finish(AnchorStatus::Failed, e.to_string())) {
                    warn!("Cannot mark {} failed: {}", record_id, t);
                }
                return Err(e);
            }
        };

        self.track(ctx, &tx_id, deadline).await?;
        self.record(record_id).ok_or(AnchorError::UnknownRecord(record_id))
    }

    async fn prepare_and_submit(
        &self,
        ctx: &LedgerContext,
        record_id: Uuid,
        digest: &[u8],
        instance_identifier: &str,
    ) -> Result<TransactionId, AnchorError> {
        let unsigned = self.construct(ctx, digest, instance_identifier).await?;
        let fee = unsigned.fee;
        let signed = self.sign(unsigned)?;
        self.update(record_id, |r| {
            r.fee = Some(fee);
            r.advance(AnchorStatus::Signed)
        })?;

        let (result, attempts) = self.submit_counted(ctx, &signed).await;
        self.update(record_id, |r| {
            r.attempt_count = attempts;
            Ok(())
        })?;
        let tx_id = result?;
        self.update(record_id, |r| {
            r.transaction_id = Some(tx_id.clone());
            r.advance(AnchorStatus::Submitted)
        })?;
        Ok(tx_id)
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Vec<AnchorRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<F>(&self, record_id: Uuid, f: F) -> Result<AnchorRecord, AnchorError>
    where
        F: FnOnce(&mut AnchorRecord) -> Result<(), TransitionError>,
    {
        let mut records = self.lock_records();
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or(AnchorError::UnknownRecord(record_id))?;
        f(record)?;
        Ok(record.clone())
    }

    fn update_by_transaction<F>(&self, id: &TransactionId, f: F) -> Result<(), AnchorError>
    where
        F: FnOnce(&mut AnchorRecord) -> Result<(), TransitionError>,
    {
        let mut records = self.lock_records();
        if let Some(record) = records.iter_mut().find(|r| r.transaction_id.as_ref() == Some(id)) {
            f(record)?;
        }
        Ok(())
    }

    pub fn record(&self, record_id: Uuid) -> Option<AnchorRecord> {
        self.lock_records().iter().find(|r| r.id == record_id).cloned()
    }

    /// All records, oldest first
    pub fn records(&self) -> Vec<AnchorRecord> {
        self.lock_records().clone()
    }

    pub fn records_for(&self, instance_identifier: &str) -> Vec<AnchorRecord> {
        self.lock_records()
            .iter()
            .filter(|r| r.instance_identifier == instance_identifier)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ManagerStats {
        let records = self.lock_records();
        let mut by_status = BTreeMap::new();
        for record in records.iter() {
            *by_status.entry(record.status).or_insert(0) += 1;
        }
        let latencies: Vec<f64> = records
            .iter()
            .filter_map(|r| r.confirmation_latency())
            .map(|d| d.num_milliseconds() as f64)
            .collect();
        let mean_confirmation_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };
        ManagerStats {
            total_records: records.len(),
            by_status,
            retries_performed: self.retry.retries_performed(),
            mean_confirmation_latency_ms,
        }
    }
}
