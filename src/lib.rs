//! Genome Anchor — content-addressed genomes anchored to a ledger
//!
//! A genome is a declarative configuration (header, units, bindings, policy
//! digest) with a canonical SHA-256 digest. Genomes build into live
//! phenotypes and encode back without drift, and their digests are anchored
//! through a signed ledger transaction tracked to finality.

pub mod config;
pub mod genome;
pub mod ledger;
pub mod phenotype;
pub mod resilience;
pub mod storage;

pub use config::{AnchorConfig, ConfigError};
pub use genome::{Digest, GenomeCodec, GenomeError, GenomeModel, HashEngine};
pub use ledger::{AnchorError, AnchorRecord, AnchorStatus, LedgerContext, TransactionLifecycleManager};
pub use phenotype::{BuildError, Phenotype, PhenotypeBuilder, PhenotypeEncoder, Resolver};
pub use resilience::{BreakerRegistry, CircuitBreaker, RetryPolicy};
pub use storage::RecordStore;
