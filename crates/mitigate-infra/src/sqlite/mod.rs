//! SQLite storage layer.
//!
//! Repository implementation backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod mitigation;
pub mod pool;

pub use mitigation::SqliteMitigationRepository;
pub use pool::DatabasePool;
