//! Genome — the declarative, content-addressed configuration of an instance
//!
//! A genome = header + logic units + capability bindings + policy digest.
//! It is pure data: nothing in this module knows about phenotypes or ledgers.

mod model;
mod hash;
mod codec;

pub use model::{
    Binding, GenomeError, GenomeHeader, GenomeModel, ParamValue, Unit, UnitKind,
    POLICY_DIGEST_LEN,
};
pub use hash::{Digest, HashEngine, CANONICAL_TAG};
pub use codec::{EncodedGenome, GenomeCodec, WireBytes, TOP_LEVEL_KEYS};

#[cfg(test)]
pub(crate) use model::tests::{sample_genome, zero_digest};
