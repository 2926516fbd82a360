//! Storage layer error types.

use thiserror::Error;

use crate::storage::logical::Recid;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transaction log write failed: {0}")]
    LogWrite(String),

    #[error("Store corruption detected: {0}")]
    Corruption(String),

    #[error("Record not found: {0}")]
    RecordNotFound(Recid),

    #[error("Invalid record id: {0}")]
    InvalidRecid(Recid),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store is unusable after a fatal error: {0}")]
    Poisoned(String),

    #[error("Store is closed")]
    Closed,
}

impl StorageError {
    /// Fatal errors leave the store in a state that only reopening (and
    /// recovery) can repair.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::LogWrite(_) | StorageError::Corruption(_)
        )
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
