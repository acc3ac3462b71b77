//! Transaction supervisor: begin, commit, rollback, and deadlock retry.

use crate::config::{RetryOptions, TxnOptions};
use crate::cupboard::Cupboard;
use crate::error::{CupboardError, CupboardResult};
use cupboard_store::{Transaction, TransactionConfig, TransactionId, TransactionStatus};
use std::thread;
use tracing::{debug, warn};

/// A cupboard transaction.
///
/// Wraps a storage transaction and exposes its observable status.
/// Operations that accept `Option<&mut Txn>` treat `None` as "no
/// transaction in force" and autocommit.
pub struct Txn {
    pub(crate) inner: Transaction,
}

impl Txn {
    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.id()
    }

    /// Returns the observable status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.inner.status()
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.inner.id())
            .field("status", &self.inner.status())
            .finish_non_exhaustive()
    }
}

impl Cupboard {
    /// Begins a transaction.
    pub fn begin(&self, options: &TxnOptions) -> CupboardResult<Txn> {
        self.ensure_open()?;
        let mut config = TransactionConfig::new().isolation(options.isolation);
        if let Some(parent) = options.parent {
            config = config.parent(parent);
        }
        let inner = self.env().begin(config)?;
        Ok(Txn { inner })
    }

    /// Commits a transaction.
    ///
    /// Fails with [`CupboardError::TransactionClosed`] if the transaction
    /// is not open.
    pub fn commit(&self, txn: &mut Txn) -> CupboardResult<()> {
        check_txn_open(txn)?;
        txn.inner.commit()?;
        Ok(())
    }

    /// Rolls back a transaction.
    ///
    /// Fails with [`CupboardError::TransactionClosed`] if the transaction
    /// is not open.
    pub fn rollback(&self, txn: &mut Txn) -> CupboardResult<()> {
        check_txn_open(txn)?;
        txn.inner.abort()?;
        Ok(())
    }

    /// Runs `body` inside a transaction, retrying on deadlock.
    ///
    /// Each attempt begins a fresh transaction (this is not a savepoint),
    /// runs `body`, and commits if the transaction is still open. On a
    /// deadlock with attempts remaining the transaction is rolled back and
    /// the loop sleeps `retry_delay` before retrying; on the final attempt
    /// the deadlock surfaces as [`CupboardError::RetriesExhausted`]. Any
    /// other error rolls back once and propagates.
    pub fn with_txn<T, F>(&self, options: &RetryOptions, mut body: F) -> CupboardResult<T>
    where
        F: FnMut(&mut Txn) -> CupboardResult<T>,
    {
        let max_attempts = options.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let mut txn = self.begin(&options.txn)?;
            let result = body(&mut txn).and_then(|value| {
                if txn.status() == TransactionStatus::Open {
                    self.commit(&mut txn)?;
                }
                Ok(value)
            });

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_deadlock() => {
                    if txn.status() == TransactionStatus::Open {
                        let _ = self.rollback(&mut txn);
                    }
                    if attempt >= max_attempts {
                        warn!(attempts = max_attempts, "deadlock retries exhausted");
                        return Err(CupboardError::RetriesExhausted {
                            attempts: max_attempts,
                        });
                    }
                    debug!(attempt, "deadlock, retrying");
                    attempt += 1;
                    thread::sleep(options.retry_delay);
                }
                Err(err) => {
                    if txn.status() == TransactionStatus::Open {
                        let _ = self.rollback(&mut txn);
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn check_txn_open(txn: &Txn) -> CupboardResult<()> {
    let status = txn.status();
    if status != TransactionStatus::Open {
        return Err(CupboardError::TransactionClosed {
            status: status.to_string(),
        });
    }
    Ok(())
}
