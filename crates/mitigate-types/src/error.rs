use thiserror::Error;

/// Errors from repository operations (used by the storage port in mitigate-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("query error: {0}")]
    Query(String),

    #[error("conflict: {0}")]
    Conflict(String),
}
