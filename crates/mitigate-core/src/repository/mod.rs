//! Repository trait definitions (ports).
//!
//! `MitigationRepository` is the storage interface that the infrastructure
//! layer (mitigate-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod mitigation;

pub use memory::InMemoryRepository;
pub use mitigation::MitigationRepository;
