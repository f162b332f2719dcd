//! Phenotype — live executable instances built from genomes
//!
//! `PhenotypeBuilder` resolves a genome's bindings through a
//! `CapabilityResolver` and instantiates its units; `PhenotypeEncoder` is the
//! structural inverse used to prove a running instance still matches the
//! digest that was anchored.

mod builder;
mod capability;
mod encoder;
mod unit;

pub use builder::{BuildError, LiveBinding, Phenotype, PhenotypeBuilder};
pub use capability::{
    Callable, Capability, CapabilityError, CapabilityResolver, Connector, EchoCapability,
    GuardedCapability, LiveResolver, ResolutionError, Resolver, TestResolver,
};
pub use encoder::{EncodeError, PhenotypeEncoder};
pub use unit::{
    AttachedCapability, EchoBehavior, ExecutableUnit, ExecutionError, FanoutBehavior, RelayBehavior,
    UnitBehavior, UnitRegistry, FALLBACK_PARAM,
};
