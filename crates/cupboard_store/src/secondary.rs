//! Secondary databases maintained from a primary.
//!
//! A secondary database maps a derived key back to the primary key it was
//! derived from. The derivation is a key-creator function supplied at open
//! time; maintenance happens automatically when a transaction's writes are
//! applied to the primary.

use crate::database::{effective_values, Database, DbShared};
use crate::env::Environment;
use crate::error::{StoreError, StoreResult};
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Derives the secondary key for a `(primary key, primary value)` pair.
///
/// Returning `None` means the record does not participate in the index.
pub type KeyCreator = Arc<dyn Fn(&[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Configuration for opening a secondary database.
#[derive(Clone)]
pub struct SecondaryConfig {
    /// Whether the secondary may be created if missing.
    pub allow_create: bool,
    /// Whether duplicate secondary keys are permitted.
    ///
    /// A non-duplicates secondary enforces a unique constraint. For an
    /// existing database the stored configuration wins.
    pub sorted_duplicates: bool,
    /// Derives the secondary key from a primary record.
    pub key_creator: KeyCreator,
}

impl SecondaryConfig {
    /// Creates a configuration with the given key creator.
    pub fn new(key_creator: KeyCreator) -> Self {
        Self {
            allow_create: true,
            sorted_duplicates: false,
            key_creator,
        }
    }

    /// Sets whether the secondary may be created if missing.
    #[must_use]
    pub fn allow_create(mut self, value: bool) -> Self {
        self.allow_create = value;
        self
    }

    /// Sets whether duplicate secondary keys are permitted.
    #[must_use]
    pub fn sorted_duplicates(mut self, value: bool) -> Self {
        self.sorted_duplicates = value;
        self
    }
}

impl std::fmt::Debug for SecondaryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryConfig")
            .field("allow_create", &self.allow_create)
            .field("sorted_duplicates", &self.sorted_duplicates)
            .finish_non_exhaustive()
    }
}

/// A secondary's registration on its primary, consulted during commit
/// apply.
pub(crate) struct SecondaryAttachment {
    pub(crate) name: String,
    pub(crate) key_creator: KeyCreator,
    pub(crate) data: Arc<DbShared>,
}

/// A handle to a secondary database.
pub struct SecondaryDatabase {
    pub(crate) env: Environment,
    pub(crate) primary: Arc<DbShared>,
    pub(crate) data: Arc<DbShared>,
    closed: AtomicBool,
}

impl Environment {
    /// Opens a secondary database attached to `primary`.
    ///
    /// A newly created secondary is populated from the primary's current
    /// contents. Reattaching a name that is already attached replaces the
    /// previous attachment.
    pub fn open_secondary(
        &self,
        primary: &Database,
        name: &str,
        config: SecondaryConfig,
    ) -> StoreResult<SecondaryDatabase> {
        self.inner.ensure_open()?;
        primary.ensure_handle_open()?;

        let (data, created) = match self.inner.load_database(name)? {
            Some(shared) => (shared, false),
            None => {
                if !config.allow_create {
                    return Err(StoreError::NotFound {
                        name: name.to_string(),
                    });
                }
                let shared = self
                    .inner
                    .create_database(name, config.sorted_duplicates)?;
                (shared, true)
            }
        };

        if created {
            populate(&primary.shared, &data, &config.key_creator, name)?;
            self.inner.persist_database(&data)?;
        }

        {
            let mut attachments = primary.shared.secondaries.write();
            attachments.retain(|att| att.name != name);
            attachments.push(SecondaryAttachment {
                name: name.to_string(),
                key_creator: Arc::clone(&config.key_creator),
                data: Arc::clone(&data),
            });
        }

        self.inner.open_databases.fetch_add(1, Ordering::SeqCst);
        debug!(name, created, "opened secondary database");

        Ok(SecondaryDatabase {
            env: self.clone(),
            primary: Arc::clone(&primary.shared),
            data,
            closed: AtomicBool::new(false),
        })
    }
}

/// Builds a fresh secondary's contents from the primary.
fn populate(
    primary: &DbShared,
    data: &DbShared,
    key_creator: &KeyCreator,
    name: &str,
) -> StoreResult<()> {
    let entries = primary.entries.read();
    for (pkey, values) in entries.iter() {
        let value = match values.first() {
            Some(value) => value,
            None => continue,
        };
        if let Some(sec_key) = key_creator(pkey, value) {
            if !data.duplicates {
                let existing = data.entries.read().get(&sec_key).cloned();
                if existing.map_or(false, |pkeys| pkeys.iter().any(|pk| pk != pkey)) {
                    return Err(StoreError::UniqueConstraint {
                        name: name.to_string(),
                    });
                }
            }
            data.apply_put(&sec_key, pkey.clone());
        }
    }
    Ok(())
}

impl SecondaryDatabase {
    /// Returns the secondary database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Whether duplicate secondary keys are permitted.
    ///
    /// This reflects the live (stored) configuration, which is the ground
    /// truth even when the open request asked for something else.
    #[must_use]
    pub fn sorted_duplicates(&self) -> bool {
        self.data.duplicates
    }

    pub(crate) fn ensure_handle_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::HandleClosed {
                name: self.data.name.clone(),
            });
        }
        self.env.inner.ensure_open()
    }

    /// Looks up a secondary key, returning the `(primary key, primary
    /// value)` pair it points at.
    ///
    /// Secondary contents reflect committed state; the transaction is used
    /// to resolve the primary record.
    pub fn get(
        &self,
        key: &[u8],
        txn: Option<&Transaction>,
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.ensure_handle_open()?;

        let pkeys = effective_values(&self.data, key, None);
        for pkey in pkeys {
            if let Some(value) = effective_values(&self.primary, &pkey, txn).into_iter().next()
            {
                return Ok(Some((pkey, value)));
            }
        }
        Ok(None)
    }

    /// Closes the handle and detaches the secondary from its primary.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::HandleClosed {
                name: self.data.name.clone(),
            });
        }
        self.primary
            .secondaries
            .write()
            .retain(|att| att.name != self.data.name);
        self.env
            .inner
            .open_databases
            .fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for SecondaryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryDatabase")
            .field("name", &self.data.name)
            .field("primary", &self.primary.name)
            .field("duplicates", &self.data.duplicates)
            .finish_non_exhaustive()
    }
}

impl Drop for SecondaryDatabase {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.primary
                .secondaries
                .write()
                .retain(|att| att.name != self.data.name);
            self.env
                .inner
                .open_databases
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;
    use crate::env::EnvironmentConfig;
    use tempfile::tempdir;

    /// Key creator that uses the first byte of the value as the key.
    fn first_byte_creator() -> KeyCreator {
        Arc::new(|_pkey, value| value.first().map(|b| vec![*b]))
    }

    fn create_env() -> (tempfile::TempDir, Environment) {
        let temp = tempdir().unwrap();
        let env = Environment::open(&temp.path().join("env"), EnvironmentConfig::default())
            .unwrap();
        (temp, env)
    }

    #[test]
    fn maintenance_on_put() {
        let (_temp, env) = create_env();
        let primary = env.open_database("p", DatabaseConfig::default()).unwrap();
        let sec = env
            .open_secondary(
                &primary,
                "p:first",
                SecondaryConfig::new(first_byte_creator()).sorted_duplicates(true),
            )
            .unwrap();

        primary.put(b"pk1", b"abc", None).unwrap();
        let (pkey, value) = sec.get(b"a", None).unwrap().unwrap();
        assert_eq!(pkey, b"pk1");
        assert_eq!(value, b"abc");
    }

    #[test]
    fn maintenance_on_overwrite_removes_stale_entry() {
        let (_temp, env) = create_env();
        let primary = env.open_database("p", DatabaseConfig::default()).unwrap();
        let sec = env
            .open_secondary(
                &primary,
                "p:first",
                SecondaryConfig::new(first_byte_creator()).sorted_duplicates(true),
            )
            .unwrap();

        primary.put(b"pk1", b"abc", None).unwrap();
        primary.put(b"pk1", b"xyz", None).unwrap();

        assert!(sec.get(b"a", None).unwrap().is_none());
        let (pkey, _) = sec.get(b"x", None).unwrap().unwrap();
        assert_eq!(pkey, b"pk1");
    }

    #[test]
    fn maintenance_on_delete() {
        let (_temp, env) = create_env();
        let primary = env.open_database("p", DatabaseConfig::default()).unwrap();
        let sec = env
            .open_secondary(
                &primary,
                "p:first",
                SecondaryConfig::new(first_byte_creator()).sorted_duplicates(true),
            )
            .unwrap();

        primary.put(b"pk1", b"abc", None).unwrap();
        primary.delete(b"pk1", None).unwrap();
        assert!(sec.get(b"a", None).unwrap().is_none());
    }

    #[test]
    fn unique_secondary_rejects_duplicate_key() {
        let (_temp, env) = create_env();
        let primary = env.open_database("p", DatabaseConfig::default()).unwrap();
        let _sec = env
            .open_secondary(
                &primary,
                "p:first",
                SecondaryConfig::new(first_byte_creator()).sorted_duplicates(false),
            )
            .unwrap();

        primary.put(b"pk1", b"abc", None).unwrap();
        let result = primary.put(b"pk2", b"axy", None);
        assert!(matches!(result, Err(StoreError::UniqueConstraint { .. })));

        // The conflicting write must not be visible.
        assert!(primary.get(b"pk2", None).unwrap().is_none());
    }

    #[test]
    fn duplicate_secondary_accepts_shared_key() {
        let (_temp, env) = create_env();
        let primary = env.open_database("p", DatabaseConfig::default()).unwrap();
        let sec = env
            .open_secondary(
                &primary,
                "p:first",
                SecondaryConfig::new(first_byte_creator()).sorted_duplicates(true),
            )
            .unwrap();

        primary.put(b"pk1", b"abc", None).unwrap();
        primary.put(b"pk2", b"axy", None).unwrap();

        let (pkey, _) = sec.get(b"a", None).unwrap().unwrap();
        assert!(pkey == b"pk1" || pkey == b"pk2");
    }

    #[test]
    fn created_secondary_is_populated_from_primary() {
        let (_temp, env) = create_env();
        let primary = env.open_database("p", DatabaseConfig::default()).unwrap();
        primary.put(b"pk1", b"abc", None).unwrap();

        let sec = env
            .open_secondary(
                &primary,
                "p:first",
                SecondaryConfig::new(first_byte_creator()).sorted_duplicates(true),
            )
            .unwrap();
        assert!(sec.get(b"a", None).unwrap().is_some());
    }

    #[test]
    fn close_detaches_maintenance() {
        let (_temp, env) = create_env();
        let primary = env.open_database("p", DatabaseConfig::default()).unwrap();
        let sec = env
            .open_secondary(
                &primary,
                "p:first",
                SecondaryConfig::new(first_byte_creator()).sorted_duplicates(true),
            )
            .unwrap();
        sec.close().unwrap();

        // No attachment left, so this put maintains nothing.
        primary.put(b"pk1", b"abc", None).unwrap();
        assert!(primary.shared.secondaries.read().is_empty());
    }

    #[test]
    fn none_from_key_creator_skips_record() {
        let (_temp, env) = create_env();
        let primary = env.open_database("p", DatabaseConfig::default()).unwrap();
        let sec = env
            .open_secondary(
                &primary,
                "p:first",
                SecondaryConfig::new(first_byte_creator()).sorted_duplicates(true),
            )
            .unwrap();

        primary.put(b"pk1", b"", None).unwrap();
        assert!(sec.get(b"", None).unwrap().is_none());
    }
}
