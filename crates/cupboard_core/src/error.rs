//! Error types for the persistence layer.

use cupboard_store::StoreError;
use std::io;
use thiserror::Error;

/// Result type for persistence operations.
pub type CupboardResult<T> = Result<T, CupboardError>;

/// Errors that can occur in persistence operations.
#[derive(Debug, Error)]
pub enum CupboardError {
    /// An argument was invalid for the requested operation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },

    /// A shelf or index name is reserved or contains a reserved character.
    #[error("invalid name {name:?}: {message}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why the name was rejected.
        message: String,
    },

    /// I/O error (directory creation and similar).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A storage operation reported a non-success outcome.
    #[error("storage failure: {message}")]
    StorageFailure {
        /// Description of the failed operation.
        message: String,
    },

    /// An operation was attempted on a transaction that is not open.
    #[error("transaction is closed (status: {status})")]
    TransactionClosed {
        /// The status the transaction was found in.
        status: String,
    },

    /// A retrieval or query referenced a field with no index.
    #[error("field {field:?} is not indexed on shelf {shelf:?}")]
    UnindexedField {
        /// The shelf searched.
        shelf: String,
        /// The field that has no index.
        field: String,
    },

    /// A deadlock-retry block gave up.
    #[error("deadlock: retries exhausted after {attempts} attempt(s)")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Record encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },
}

impl CupboardError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid name error.
    pub fn invalid_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a storage failure error.
    pub fn storage_failure(message: impl Into<String>) -> Self {
        Self::StorageFailure {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Returns true if this error is (or wraps) a storage lock conflict
    /// that a retry loop may resolve.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_deadlock())
    }
}
