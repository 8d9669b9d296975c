//! Risk mitigation workflow engine: business logic and repository ports.
//!
//! This crate defines the storage port (`MitigationRepository`) that the
//! infrastructure layer implements, and everything that runs on top of it:
//! definition store, trigger matcher, execution state machine, escalation
//! coordinator and deadline monitor. It depends only on `mitigate-types`,
//! never on `mitigate-infra` or any database/IO crate.

pub mod engine;
pub mod escalation;
pub mod event;
pub mod monitor;
pub mod report;
pub mod repository;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
