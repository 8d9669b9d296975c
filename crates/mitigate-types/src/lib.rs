//! Shared domain types for the mitigate risk workflow engine.
//!
//! Playbook definitions, executions, escalation rules, events, configuration
//! and report types, plus the repository error used by the storage port.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod error;
pub mod escalation;
pub mod event;
pub mod execution;
pub mod report;
pub mod signal;
