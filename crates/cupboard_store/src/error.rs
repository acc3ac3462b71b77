//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the environment lock.
    #[error("environment locked: another process has exclusive access")]
    EnvironmentLocked,

    /// The environment handle has been closed.
    #[error("environment is closed")]
    EnvironmentClosed,

    /// The environment still has open handles.
    #[error("environment has open handles: {databases} database(s), {cursors} cursor(s)")]
    HandlesStillOpen {
        /// Number of open database handles.
        databases: usize,
        /// Number of open cursors.
        cursors: usize,
    },

    /// A database, cursor, or secondary handle was used after close.
    #[error("handle is closed: {name}")]
    HandleClosed {
        /// Name of the closed handle.
        name: String,
    },

    /// The named database does not exist and creation was not permitted.
    #[error("database not found: {name}")]
    NotFound {
        /// Name of the database.
        name: String,
    },

    /// A write was attempted on a read-only database handle.
    #[error("database is read-only: {name}")]
    ReadOnly {
        /// Name of the database.
        name: String,
    },

    /// A stored file is corrupted or has an unsupported format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// A lock request conflicted with another live transaction.
    ///
    /// The engine resolves conflicts by immediately failing the requester
    /// rather than blocking; callers are expected to roll back and retry.
    #[error("deadlock: lock on key held by transaction {holder}")]
    Deadlock {
        /// The transaction currently holding the lock.
        holder: u64,
    },

    /// A unique secondary database rejected a duplicate key.
    #[error("unique constraint violated on secondary database {name}")]
    UniqueConstraint {
        /// Name of the secondary database.
        name: String,
    },

    /// An operation was attempted on a transaction that is not open.
    #[error("transaction {id} is not open (status: {status})")]
    TransactionNotOpen {
        /// The transaction ID.
        id: u64,
        /// The status it was found in.
        status: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl StoreError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error is a lock conflict that a caller may
    /// resolve by rolling back and retrying.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }
}
