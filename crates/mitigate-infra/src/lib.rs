//! Infrastructure layer for mitigate.
//!
//! Implements the storage port defined in `mitigate-core` with SQLite, and
//! loads engine configuration from the data directory.

pub mod config;
pub mod sqlite;
