//! Storage error types.

use qkdnet_core::QkdError;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A record that must exist does not.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of record ("block", "link", ...).
        entity: &'static str,
        /// Its identifier.
        id: String,
    },

    /// Write would contradict stored state (e.g. a block id reused on
    /// another link).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<StorageError> for QkdError {
    fn from(err: StorageError) -> Self {
        QkdError::Storage(err.to_string())
    }
}
