//! Transactions with buffered writes and per-key locking.
//!
//! Writes are buffered on the transaction and applied at commit, together
//! with secondary-database maintenance. Each buffered write acquires a
//! per-`(database, key)` lock; a lock held by another live transaction
//! fails the requester immediately with [`StoreError::Deadlock`], which
//! callers resolve by rolling back and retrying.

use crate::database::DbShared;
use crate::env::{EnvInner, Environment};
use crate::error::{StoreError, StoreResult};
use crate::types::{Isolation, TransactionId, TransactionStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Configuration for beginning a transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// Requested isolation level.
    pub isolation: Isolation,
    /// Parent transaction, recorded for diagnostics. Nesting is flat:
    /// the child acquires its own locks and commits independently.
    pub parent: Option<TransactionId>,
}

impl TransactionConfig {
    /// Creates a new configuration with default values.
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

/// A buffered write operation.
enum PendingOp {
    Put { value: Vec<u8> },
    Delete,
}

struct PendingWrite {
    db: Arc<DbShared>,
    key: Vec<u8>,
    op: PendingOp,
}

/// A transaction.
///
/// The status is observable via [`Transaction::status`]; commit and abort
/// require the transaction to be open. A transaction dropped while open is
/// aborted and its locks released.
pub struct Transaction {
    env: Arc<EnvInner>,
    id: u64,
    isolation: Isolation,
    parent: Option<TransactionId>,
    status: TransactionStatus,
    writes: Vec<PendingWrite>,
    locked: Vec<(u64, Vec<u8>)>,
}

impl Environment {
    /// Begins a new transaction.
    pub fn begin(&self, config: TransactionConfig) -> StoreResult<Transaction> {
        self.inner.ensure_open()?;
        if !self.inner.transactional {
            return Err(StoreError::invalid_operation(
                "environment is not transactional",
            ));
        }

        let id = self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst);
        self.inner.active_txns.fetch_add(1, Ordering::SeqCst);
        debug!(id, isolation = ?config.isolation, "began transaction");

        Ok(Transaction {
            env: Arc::clone(&self.inner),
            id,
            isolation: config.isolation,
            parent: config.parent,
            status: TransactionStatus::Open,
            writes: Vec::new(),
            locked: Vec::new(),
        })
    }
}

impl Transaction {
    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        TransactionId::new(self.id)
    }

    /// Returns the observable status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Returns the requested isolation level.
    #[must_use]
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Returns the parent transaction, if one was recorded.
    #[must_use]
    pub fn parent(&self) -> Option<TransactionId> {
        self.parent
    }

    pub(crate) fn ensure_status_open(&self) -> StoreResult<()> {
        if self.status != TransactionStatus::Open {
            return Err(StoreError::TransactionNotOpen {
                id: self.id,
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    /// Acquires the write lock on a key for this transaction.
    pub(crate) fn lock(&mut self, shared: &Arc<DbShared>, key: &[u8]) -> StoreResult<()> {
        if self.env.lock_key(self.id, shared.file_id, key)? {
            self.locked.push((shared.file_id, key.to_vec()));
        }
        Ok(())
    }

    pub(crate) fn record_put(&mut self, db: Arc<DbShared>, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push(PendingWrite {
            db,
            key,
            op: PendingOp::Put { value },
        });
    }

    pub(crate) fn record_delete(&mut self, db: Arc<DbShared>, key: Vec<u8>) {
        self.writes.push(PendingWrite {
            db,
            key,
            op: PendingOp::Delete,
        });
    }

    /// Applies this transaction's pending writes for a key on top of the
    /// committed values.
    pub(crate) fn overlay_values(
        &self,
        shared: &DbShared,
        key: &[u8],
        mut values: Vec<Vec<u8>>,
    ) -> Vec<Vec<u8>> {
        for write in &self.writes {
            if write.db.file_id != shared.file_id || write.key != key {
                continue;
            }
            match &write.op {
                PendingOp::Put { value } => {
                    if shared.duplicates {
                        if let Err(pos) = values.binary_search(value) {
                            values.insert(pos, value.clone());
                        }
                    } else {
                        values.clear();
                        values.push(value.clone());
                    }
                }
                PendingOp::Delete => values.clear(),
            }
        }
        values
    }

    /// Returns the distinct keys this transaction has written in a database.
    pub(crate) fn overlay_keys(&self, shared: &DbShared) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for write in &self.writes {
            if write.db.file_id == shared.file_id && !keys.contains(&write.key) {
                keys.push(write.key.clone());
            }
        }
        keys
    }

    /// Commits the transaction.
    ///
    /// Buffered writes are validated against unique secondary constraints,
    /// applied (with secondary maintenance), and the dirtied databases are
    /// persisted. On a constraint violation the transaction stays open and
    /// nothing is applied; the caller is expected to roll back.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.ensure_status_open()?;
        self.env.ensure_open()?;

        self.validate_unique_constraints()?;

        let mut dirty: HashMap<u64, Arc<DbShared>> = HashMap::new();
        for write in &self.writes {
            let old = write
                .db
                .entries
                .read()
                .get(&write.key)
                .and_then(|values| values.first().cloned());

            let secondaries = write.db.secondaries.read();
            match &write.op {
                PendingOp::Put { value } => {
                    for att in secondaries.iter() {
                        if let Some(old_value) = &old {
                            if let Some(old_sec) = (att.key_creator)(&write.key, old_value) {
                                att.data.apply_remove_value(&old_sec, &write.key);
                            }
                        }
                        if let Some(new_sec) = (att.key_creator)(&write.key, value) {
                            att.data.apply_put(&new_sec, write.key.clone());
                        }
                        dirty.insert(att.data.file_id, Arc::clone(&att.data));
                    }
                    write.db.apply_put(&write.key, value.clone());
                }
                PendingOp::Delete => {
                    for att in secondaries.iter() {
                        if let Some(old_value) = &old {
                            if let Some(old_sec) = (att.key_creator)(&write.key, old_value) {
                                att.data.apply_remove_value(&old_sec, &write.key);
                            }
                        }
                        dirty.insert(att.data.file_id, Arc::clone(&att.data));
                    }
                    write.db.apply_delete(&write.key);
                }
            }
            drop(secondaries);
            dirty.insert(write.db.file_id, Arc::clone(&write.db));
        }

        for shared in dirty.values() {
            self.env.persist_database(shared)?;
        }

        self.finish(TransactionStatus::Committed);
        debug!(id = self.id, "committed transaction");
        Ok(())
    }

    /// Aborts the transaction, discarding buffered writes.
    pub fn abort(&mut self) -> StoreResult<()> {
        self.ensure_status_open()?;
        self.finish(TransactionStatus::Aborted);
        debug!(id = self.id, "aborted transaction");
        Ok(())
    }

    fn finish(&mut self, status: TransactionStatus) {
        self.env.release_locks(&self.locked);
        self.locked.clear();
        self.writes.clear();
        self.status = status;
        self.env.active_txns.fetch_sub(1, Ordering::SeqCst);
    }

    /// Simulates the writes in order and rejects any that would leave a
    /// unique (non-duplicates) secondary with two distinct primary keys
    /// under one secondary key.
    fn validate_unique_constraints(&self) -> StoreResult<()> {
        // Running first-value view of each touched primary key.
        let mut pre: HashMap<(u64, Vec<u8>), Option<Vec<u8>>> = HashMap::new();
        // Primary keys scheduled for removal under a secondary key.
        let mut removed: HashMap<(u64, Vec<u8>), HashSet<Vec<u8>>> = HashMap::new();
        // Primary key scheduled for insertion under a secondary key.
        let mut planned: HashMap<(u64, Vec<u8>), Vec<u8>> = HashMap::new();

        for write in &self.writes {
            let slot = pre
                .entry((write.db.file_id, write.key.clone()))
                .or_insert_with(|| {
                    write
                        .db
                        .entries
                        .read()
                        .get(&write.key)
                        .and_then(|values| values.first().cloned())
                });
            let old = slot.clone();

            let secondaries = write.db.secondaries.read();
            let unique_atts = secondaries.iter().filter(|att| !att.data.duplicates);
            match &write.op {
                PendingOp::Put { value } => {
                    for att in unique_atts {
                        if let Some(old_value) = &old {
                            if let Some(old_sec) = (att.key_creator)(&write.key, old_value) {
                                let entry = (att.data.file_id, old_sec);
                                if planned.get(&entry) == Some(&write.key) {
                                    planned.remove(&entry);
                                }
                                removed.entry(entry).or_default().insert(write.key.clone());
                            }
                        }
                        if let Some(new_sec) = (att.key_creator)(&write.key, value) {
                            let entry = (att.data.file_id, new_sec.clone());
                            let existing = att
                                .data
                                .entries
                                .read()
                                .get(&new_sec)
                                .cloned()
                                .unwrap_or_default();
                            let removals = removed.get(&entry);
                            let conflict = existing.iter().any(|pkey| {
                                pkey != &write.key
                                    && removals.map_or(true, |r| !r.contains(pkey))
                            });
                            let planned_conflict =
                                planned.get(&entry).map_or(false, |pkey| pkey != &write.key);
                            if conflict || planned_conflict {
                                return Err(StoreError::UniqueConstraint {
                                    name: att.name.clone(),
                                });
                            }
                            removed.entry(entry.clone()).or_default().remove(&write.key);
                            planned.insert(entry, write.key.clone());
                        }
                    }
                    *slot = Some(value.clone());
                }
                PendingOp::Delete => {
                    for att in unique_atts {
                        if let Some(old_value) = &old {
                            if let Some(old_sec) = (att.key_creator)(&write.key, old_value) {
                                let entry = (att.data.file_id, old_sec);
                                if planned.get(&entry) == Some(&write.key) {
                                    planned.remove(&entry);
                                }
                                removed.entry(entry).or_default().insert(write.key.clone());
                            }
                        }
                    }
                    *slot = None;
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("pending_writes", &self.writes.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status == TransactionStatus::Open {
            self.finish(TransactionStatus::Aborted);
        }
    }
}
