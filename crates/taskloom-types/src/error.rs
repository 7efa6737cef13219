use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an activity failure, used by retry policies to decide
/// whether another attempt can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityErrorKind {
    /// Network blips, rate limits, unavailable providers.
    Transient,
    Timeout,
    /// Bad input; the same call will fail again.
    Validation,
    /// Expression or template evaluation failed.
    Expression,
    NotFound,
    Cancelled,
    Internal,
}

/// Errors from repository operations (used by trait definitions in taskloom-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the large-payload store.
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("payload '{0}' not found in store")]
    Missing(String),

    #[error("payload store I/O error: {0}")]
    Io(String),

    #[error("payload serialization error: {0}")]
    Serialization(String),
}
