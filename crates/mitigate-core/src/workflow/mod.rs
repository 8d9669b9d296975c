//! Playbook definitions and step execution building blocks.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `dag` -- dependency validation and stable topological step order
//! - `store` -- concurrent definition registry
//! - `matcher` -- weighted trigger scoring and definition selection
//! - `handler` -- step handler trait, built-in handlers, dispatch by type
//! - `approval` -- parking approval steps until an operator responds
//! - `retry` -- retry budget, backoff and failure routing
//! - `checkpoint` -- write-through persistence of execution state
//! - `defaults` -- built-in playbooks and escalation rule

pub mod approval;
pub mod checkpoint;
pub mod dag;
pub mod defaults;
pub mod definition;
pub mod handler;
pub mod matcher;
pub mod retry;
pub mod store;
