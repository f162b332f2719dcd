//! PhenotypeEncoder — reads a genome back out of a live phenotype

use super::builder::Phenotype;
use crate::genome::{Digest, GenomeError, GenomeModel, HashEngine};
use log::info;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error(transparent)]
    Genome(#[from] GenomeError),

    #[error("integrity mismatch: genome digests to {expected} but its phenotype encodes to {actual}")]
    IntegrityMismatch { expected: Digest, actual: Digest },
}

pub struct PhenotypeEncoder;

impl PhenotypeEncoder {
    /// Reconstruct the genome a phenotype currently embodies. Unit and
    /// binding order is preserved; resolved callables are not part of it.
    pub fn encode(phenotype: &Phenotype) -> GenomeModel {
        GenomeModel {
            header: phenotype.header().clone(),
            units: phenotype.units().iter().map(|u| u.definition().clone()).collect(),
            bindings: phenotype.bindings().iter().map(|b| b.definition().clone()).collect(),
            policy_digest: phenotype.policy_digest().to_string(),
        }
    }

    /// Check that `phenotype` still encodes to the digest of `original`
    pub fn verify(original: &GenomeModel, phenotype: &Phenotype) -> Result<Digest, EncodeError> {
        let expected = HashEngine::genome_digest(original)?;
        let actual = HashEngine::genome_digest(&Self::encode(phenotype))?;
        if expected != actual {
            return Err(EncodeError::IntegrityMismatch { expected, actual });
        }
        info!(
            "Phenotype {} verified against digest {}",
            phenotype.instance_identifier(),
            expected.short()
        );
        Ok(expected)
    }
}
