//! Primary database handles.

use crate::env::Environment;
use crate::error::{StoreError, StoreResult};
use crate::secondary::SecondaryAttachment;
use crate::transaction::{Transaction, TransactionConfig};
use crate::types::WriteOutcome;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Whether the database may be created if missing.
    pub allow_create: bool,
    /// Whether duplicate keys are permitted.
    ///
    /// For an existing database the stored configuration wins; this flag
    /// only takes effect at creation.
    pub sorted_duplicates: bool,
    /// Whether the handle rejects writes.
    pub read_only: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            allow_create: true,
            sorted_duplicates: false,
            read_only: false,
        }
    }
}

impl DatabaseConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the database may be created if missing.
    #[must_use]
    pub const fn allow_create(mut self, value: bool) -> Self {
        self.allow_create = value;
        self
    }

    /// Sets whether duplicate keys are permitted.
    #[must_use]
    pub const fn sorted_duplicates(mut self, value: bool) -> Self {
        self.sorted_duplicates = value;
        self
    }

    /// Sets whether the handle rejects writes.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }
}

/// Resident state of a database, shared between handles, transactions,
/// and cursors.
pub(crate) struct DbShared {
    /// Database name.
    pub(crate) name: String,
    /// Stable file id.
    pub(crate) file_id: u64,
    /// Whether duplicate keys are permitted (stored configuration).
    pub(crate) duplicates: bool,
    /// Key to values mapping. Non-duplicate databases hold exactly one
    /// value per key; duplicate databases hold a sorted list.
    pub(crate) entries: RwLock<BTreeMap<Vec<u8>, Vec<Vec<u8>>>>,
    /// Secondary databases attached to this primary.
    pub(crate) secondaries: RwLock<Vec<SecondaryAttachment>>,
}

impl DbShared {
    /// Inserts a value for a key directly into the committed state.
    ///
    /// Duplicate databases keep values sorted; non-duplicate databases
    /// overwrite.
    pub(crate) fn apply_put(&self, key: &[u8], value: Vec<u8>) {
        let mut entries = self.entries.write();
        if self.duplicates {
            let values = entries.entry(key.to_vec()).or_default();
            match values.binary_search(&value) {
                Ok(_) => {} // identical (key, value) pair already present
                Err(pos) => values.insert(pos, value),
            }
        } else {
            entries.insert(key.to_vec(), vec![value]);
        }
    }

    /// Removes a key (all values) from the committed state.
    pub(crate) fn apply_delete(&self, key: &[u8]) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Removes a single `(key, value)` pair from the committed state.
    pub(crate) fn apply_remove_value(&self, key: &[u8], value: &[u8]) {
        let mut entries = self.entries.write();
        if let Some(values) = entries.get_mut(key) {
            values.retain(|v| v != value);
            if values.is_empty() {
                entries.remove(key);
            }
        }
    }
}

/// Returns the values visible for a key: committed state plus the
/// transaction's pending overlay, if any.
pub(crate) fn effective_values(
    shared: &DbShared,
    key: &[u8],
    txn: Option<&Transaction>,
) -> Vec<Vec<u8>> {
    let committed = shared
        .entries
        .read()
        .get(key)
        .cloned()
        .unwrap_or_default();
    match txn {
        Some(txn) => txn.overlay_values(shared, key, committed),
        None => committed,
    }
}

/// A handle to a primary database.
///
/// Handles are closed exactly once; the underlying data stays resident in
/// the environment so a reopen observes the same state.
pub struct Database {
    pub(crate) env: Environment,
    pub(crate) shared: Arc<DbShared>,
    read_only: bool,
    closed: AtomicBool,
}

impl Environment {
    /// Opens a database by name.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the database does not exist and
    ///   `allow_create` is false
    pub fn open_database(&self, name: &str, config: DatabaseConfig) -> StoreResult<Database> {
        self.inner.ensure_open()?;

        let shared = match self.inner.load_database(name)? {
            Some(shared) => shared,
            None => {
                if !config.allow_create {
                    return Err(StoreError::NotFound {
                        name: name.to_string(),
                    });
                }
                self.inner
                    .create_database(name, config.sorted_duplicates)?
            }
        };

        self.inner.open_databases.fetch_add(1, Ordering::SeqCst);

        Ok(Database {
            env: self.clone(),
            shared,
            read_only: config.read_only,
            closed: AtomicBool::new(false),
        })
    }
}

impl Database {
    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether duplicate keys are permitted (the stored configuration).
    #[must_use]
    pub fn sorted_duplicates(&self) -> bool {
        self.shared.duplicates
    }

    /// Whether this handle rejects writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn ensure_handle_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::HandleClosed {
                name: self.shared.name.clone(),
            });
        }
        self.env.inner.ensure_open()
    }

    /// Gets the value for a key.
    ///
    /// Duplicate databases return the first value in sort order. With a
    /// transaction, the transaction's pending writes are visible.
    pub fn get(&self, key: &[u8], txn: Option<&Transaction>) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_handle_open()?;
        if let Some(txn) = txn {
            txn.ensure_status_open()?;
        }
        Ok(effective_values(&self.shared, key, txn).into_iter().next())
    }

    /// Puts a key-value pair.
    ///
    /// With a transaction the write is buffered and a per-key lock is
    /// acquired; without one the write autocommits. Non-duplicate
    /// databases overwrite an existing key.
    pub fn put(
        &self,
        key: &[u8],
        value: &[u8],
        txn: Option<&mut Transaction>,
    ) -> StoreResult<WriteOutcome> {
        self.ensure_handle_open()?;
        if self.read_only {
            return Err(StoreError::ReadOnly {
                name: self.shared.name.clone(),
            });
        }

        match txn {
            Some(txn) => {
                txn.ensure_status_open()?;
                txn.lock(&self.shared, key)?;
                txn.record_put(Arc::clone(&self.shared), key.to_vec(), value.to_vec());
                Ok(WriteOutcome::Success)
            }
            None => {
                let mut txn = self.env.begin(TransactionConfig::default())?;
                txn.lock(&self.shared, key)?;
                txn.record_put(Arc::clone(&self.shared), key.to_vec(), value.to_vec());
                txn.commit()?;
                Ok(WriteOutcome::Success)
            }
        }
    }

    /// Deletes a key (all of its values).
    ///
    /// Returns [`WriteOutcome::NotFound`] if the key is absent in the
    /// caller's view.
    pub fn delete(
        &self,
        key: &[u8],
        txn: Option<&mut Transaction>,
    ) -> StoreResult<WriteOutcome> {
        self.ensure_handle_open()?;
        if self.read_only {
            return Err(StoreError::ReadOnly {
                name: self.shared.name.clone(),
            });
        }

        match txn {
            Some(txn) => {
                txn.ensure_status_open()?;
                if effective_values(&self.shared, key, Some(txn)).is_empty() {
                    return Ok(WriteOutcome::NotFound);
                }
                txn.lock(&self.shared, key)?;
                txn.record_delete(Arc::clone(&self.shared), key.to_vec());
                Ok(WriteOutcome::Success)
            }
            None => {
                if effective_values(&self.shared, key, None).is_empty() {
                    return Ok(WriteOutcome::NotFound);
                }
                let mut txn = self.env.begin(TransactionConfig::default())?;
                txn.lock(&self.shared, key)?;
                txn.record_delete(Arc::clone(&self.shared), key.to_vec());
                txn.commit()?;
                Ok(WriteOutcome::Success)
            }
        }
    }

    /// Closes the handle.
    ///
    /// Closing twice is an error; the data stays resident in the
    /// environment for a later reopen.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::HandleClosed {
                name: self.shared.name.clone(),
            });
        }
        self.env
            .inner
            .open_databases
            .fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.shared.name)
            .field("duplicates", &self.shared.duplicates)
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.env
                .inner
                .open_databases
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}
