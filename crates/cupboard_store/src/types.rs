//! Core type definitions for the storage engine.

use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing within an environment and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Observable status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Transaction is open and can perform operations.
    Open,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Committed => write!(f, "committed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Isolation level requested at transaction begin.
///
/// The level is recorded on the transaction; writes always take per-key
/// locks regardless of level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Reads may observe data written by concurrent transactions.
    ReadUncommitted,
    /// Reads observe committed data only.
    ReadCommitted,
    /// Reads are stable for the transaction's lifetime.
    #[default]
    RepeatableRead,
}

/// Lock mode for cursor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// No read locks; may observe uncommitted overlay data.
    #[default]
    ReadUncommitted,
    /// No read locks; committed data only.
    ReadCommitted,
    /// Read-modify-write: acquire the write lock at read time.
    Rmw,
}

/// Outcome of a write operation.
///
/// `Success` is the sentinel callers check before treating a write as
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was recorded.
    Success,
    /// The key was not present (deletes only).
    NotFound,
    /// The key already exists and overwriting was not permitted.
    KeyExists,
}

impl WriteOutcome {
    /// Returns true if the write was recorded.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}
