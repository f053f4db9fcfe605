//! Storage-specific error types.
//!
//! Registry, sample and event queries all fail with [`StorageError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Sample or event payload could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Data directory could not be prepared, or an unexpected registry failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// A stored row no longer maps onto its type (unknown enum label,
    /// out-of-range key version).
    #[error("invalid data: {0}")]
    InvalidData(String),
}
