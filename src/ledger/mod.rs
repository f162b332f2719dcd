//! Ledger anchoring — transactions, the node seam and the lifecycle manager
//!
//! Works on digest bytes only; nothing here knows what a genome is.

mod manager;
mod node;
mod record;
mod transaction;

pub use manager::{
    AnchorError, LedgerContext, ManagerStats, SignerIdentity, TrackOutcome, TransactionLifecycleManager,
};
pub use node::{InclusionStatus, LedgerNode, NodeError, SimulatedNode, TransactionId};
pub use record::{AnchorRecord, AnchorStatus, TransitionError};
pub use transaction::{
    EnvKeyProvider, KeyMaterial, KeyProvider, SignedTransaction, SigningError, StaticKeyProvider,
    UnsignedTransaction,
};
