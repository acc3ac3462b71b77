//! Configuration and per-operation options.

use cupboard_store::{Isolation, LockMode, TransactionId};
use std::time::Duration;

/// Configuration for opening a cupboard.
#[derive(Debug, Clone)]
pub struct CupboardConfig {
    /// Whether the underlying environment supports transactions.
    pub transactional: bool,
}

impl Default for CupboardConfig {
    fn default() -> Self {
        Self {
            transactional: true,
        }
    }
}

impl CupboardConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the environment supports transactions.
    #[must_use]
    pub const fn transactional(mut self, value: bool) -> Self {
        self.transactional = value;
        self
    }
}

/// Options for opening a shelf.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShelfOptions {
    /// Open the primary database read-only.
    ///
    /// This is the only caller option merged into the shelf's stored
    /// options.
    pub read_only: bool,
    /// Close the shelf first if it is already open.
    pub force_reopen: bool,
}

impl ShelfOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read-only flag.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the force-reopen flag.
    #[must_use]
    pub const fn force_reopen(mut self, value: bool) -> Self {
        self.force_reopen = value;
        self
    }
}

/// Options for opening an index.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexOptions {
    /// Whether the index permits duplicate keys.
    ///
    /// This is the only recognized per-call option. `None` defers to the
    /// stored options (or `false` for a brand-new index). For an existing
    /// index the live database configuration wins regardless.
    pub sorted_duplicates: Option<bool>,
}

impl IndexOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the index permits duplicate keys.
    #[must_use]
    pub const fn sorted_duplicates(mut self, value: bool) -> Self {
        self.sorted_duplicates = Some(value);
        self
    }
}

/// Options for a query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Shelf to query; defaults to the `_default` shelf.
    pub shelf: Option<String>,
    /// Maximum number of records to materialize.
    pub limit: Option<usize>,
    /// Lock mode for cursor reads.
    pub lock_mode: LockMode,
}

impl QueryOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the shelf to query.
    #[must_use]
    pub fn shelf(mut self, name: impl Into<String>) -> Self {
        self.shelf = Some(name.into());
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the lock mode.
    #[must_use]
    pub const fn lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }
}

/// Options for beginning a transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    /// Requested isolation level.
    pub isolation: Isolation,
    /// Parent transaction, if any.
    pub parent: Option<TransactionId>,
}

impl TxnOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the isolation level.
    #[must_use]
    pub const fn isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sets the parent transaction.
    #[must_use]
    pub const fn parent(mut self, parent: TransactionId) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Options for a deadlock-retry block.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum number of attempts (minimum 1).
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub retry_delay: Duration,
    /// Options for each attempt's transaction.
    pub txn: TxnOptions,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay: Duration::from_millis(50),
            txn: TxnOptions::default(),
        }
    }
}

impl RetryOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = value;
        self
    }

    /// Sets the sleep between attempts.
    #[must_use]
    pub const fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = value;
        self
    }

    /// Sets the per-attempt transaction options.
    #[must_use]
    pub const fn txn(mut self, value: TxnOptions) -> Self {
        self.txn = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_defaults() {
        let opts = RetryOptions::default();
        assert_eq!(opts.max_attempts, 1);
        assert_eq!(opts.retry_delay, Duration::from_millis(50));
    }

    #[test]
    fn builder_pattern() {
        let opts = ShelfOptions::new().read_only(true).force_reopen(true);
        assert!(opts.read_only);
        assert!(opts.force_reopen);

        let idx = IndexOptions::new().sorted_duplicates(true);
        assert_eq!(idx.sorted_duplicates, Some(true));
    }
}
