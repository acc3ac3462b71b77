//! Shelves: named primary record collections with secondary indices.

use crate::catalog::{self, Catalog, StoredIndexOptions};
use crate::config::IndexOptions;
use crate::error::{CupboardError, CupboardResult};
use crate::record::Record;
use crate::shape::FieldIndex;
use crate::value::Value;
use cupboard_store::{
    Database, Environment, KeyCreator, SecondaryConfig, SecondaryDatabase,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds the key-creator for an index: decode the stored record and
/// produce the order-preserving encoding of the indexed field.
///
/// The index name is both the index identity and the field it indexes.
pub(crate) fn key_creator_for(field: &str) -> KeyCreator {
    let field = field.to_string();
    Arc::new(move |_pkey: &[u8], value: &[u8]| {
        let record = Record::decode(value).ok()?;
        record.fields.get(&field).map(Value::encode_key)
    })
}

/// A named primary record collection.
///
/// A shelf holds the primary database plus two index registries: unique
/// indices (no duplicate keys) and any indices (duplicates permitted). An
/// index lives in exactly one of the two registries, classified by the
/// live database's duplicates setting.
pub struct Shelf {
    name: String,
    pub(crate) primary: Database,
    pub(crate) unique_indexes: RwLock<HashMap<String, SecondaryDatabase>>,
    pub(crate) any_indexes: RwLock<HashMap<String, SecondaryDatabase>>,
    /// Serializes index opens per shelf so two callers cannot race a
    /// double-open of the same index.
    index_lock: Mutex<()>,
}

impl Shelf {
    pub(crate) fn new(name: String, primary: Database) -> Self {
        Self {
            name,
            primary,
            unique_indexes: RwLock::new(HashMap::new()),
            any_indexes: RwLock::new(HashMap::new()),
            index_lock: Mutex::new(()),
        }
    }

    /// Returns the shelf name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the primary database handle.
    #[must_use]
    pub fn primary(&self) -> &Database {
        &self.primary
    }

    /// Returns how a field is indexed on this shelf, if at all.
    #[must_use]
    pub fn index_kind(&self, index: &str) -> Option<FieldIndex> {
        if self.unique_indexes.read().contains_key(index) {
            Some(FieldIndex::Unique)
        } else if self.any_indexes.read().contains_key(index) {
            Some(FieldIndex::Any)
        } else {
            None
        }
    }

    /// Returns the names of all open indices.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .unique_indexes
            .read()
            .keys()
            .chain(self.any_indexes.read().keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Opens (or returns) the index for a field.
    ///
    /// Stored options are merged with the caller's `sorted_duplicates`
    /// request, but the live database configuration is the ground truth
    /// that decides whether the index registers as unique or any.
    pub(crate) fn open_index(
        &self,
        env: &Environment,
        catalog: &Catalog,
        index: &str,
        options: &IndexOptions,
    ) -> CupboardResult<()> {
        catalog::validate_index_name(index)?;

        if self.index_kind(index).is_some() {
            return Ok(());
        }

        let _guard = self.index_lock.lock();
        if self.index_kind(index).is_some() {
            return Ok(());
        }

        let stored = catalog.index_options(&self.name, index)?;
        let requested = options
            .sorted_duplicates
            .or(stored.map(|opts| opts.sorted_duplicates))
            .unwrap_or(false);

        let secondary = env.open_secondary(
            &self.primary,
            &catalog::composite_name(&self.name, index),
            SecondaryConfig::new(key_creator_for(index)).sorted_duplicates(requested),
        )?;

        // The live configuration wins over whatever was requested.
        let duplicates = secondary.sorted_duplicates();
        catalog.set_index_options(
            &self.name,
            index,
            StoredIndexOptions {
                sorted_duplicates: duplicates,
            },
        )?;

        debug!(shelf = %self.name, index, duplicates, "opened index");
        if duplicates {
            self.any_indexes
                .write()
                .insert(index.to_string(), secondary);
        } else {
            self.unique_indexes
                .write()
                .insert(index.to_string(), secondary);
        }
        Ok(())
    }

    /// Closes every index, optionally removing its database and catalog
    /// entry. Continues past failures and reports the first one.
    pub(crate) fn close_indices(
        &self,
        env: &Environment,
        catalog: &Catalog,
        remove: bool,
    ) -> CupboardResult<()> {
        let mut first_error = None;

        let mut indices: Vec<(String, SecondaryDatabase)> = Vec::new();
        indices.extend(self.unique_indexes.write().drain());
        indices.extend(self.any_indexes.write().drain());

        for (index, secondary) in indices {
            if let Err(err) = secondary.close() {
                first_error.get_or_insert(CupboardError::from(err));
            }
            if remove {
                let composite = catalog::composite_name(&self.name, &index);
                match env.remove_database(&composite) {
                    Ok(true) => {}
                    Ok(false) => {
                        first_error.get_or_insert(CupboardError::storage_failure(format!(
                            "index database {composite:?} was not removed"
                        )));
                    }
                    Err(err) => {
                        first_error.get_or_insert(CupboardError::from(err));
                    }
                }
                if let Err(err) = catalog.remove_index_options(&self.name, &index) {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Shelf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shelf")
            .field("name", &self.name)
            .field("indices", &self.index_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cupboard_store::{DatabaseConfig, EnvironmentConfig};
    use tempfile::tempdir;

    fn create_shelf() -> (tempfile::TempDir, Environment, Catalog, Shelf) {
        let temp = tempdir().unwrap();
        let env = Environment::open(&temp.path().join("env"), EnvironmentConfig::default())
            .unwrap();
        let catalog = Catalog::open(&env, true).unwrap();
        let primary = env
            .open_database("books", DatabaseConfig::default())
            .unwrap();
        let shelf = Shelf::new("books".to_string(), primary);
        (temp, env, catalog, shelf)
    }

    #[test]
    fn open_index_registers_by_duplicates_setting() {
        let (_temp, env, catalog, shelf) = create_shelf();

        shelf
            .open_index(&env, &catalog, "title", &IndexOptions::new().sorted_duplicates(true))
            .unwrap();
        shelf
            .open_index(&env, &catalog, "isbn", &IndexOptions::new().sorted_duplicates(false))
            .unwrap();

        assert_eq!(shelf.index_kind("title"), Some(FieldIndex::Any));
        assert_eq!(shelf.index_kind("isbn"), Some(FieldIndex::Unique));
        assert_eq!(shelf.index_kind("year"), None);
        assert_eq!(shelf.index_names(), vec!["isbn", "title"]);
    }

    #[test]
    fn open_index_is_idempotent() {
        let (_temp, env, catalog, shelf) = create_shelf();

        shelf
            .open_index(&env, &catalog, "title", &IndexOptions::new().sorted_duplicates(true))
            .unwrap();
        // A second open with a conflicting request keeps the live setting.
        shelf
            .open_index(&env, &catalog, "title", &IndexOptions::new().sorted_duplicates(false))
            .unwrap();
        assert_eq!(shelf.index_kind("title"), Some(FieldIndex::Any));
    }

    #[test]
    fn open_index_rejects_reserved_names() {
        let (_temp, env, catalog, shelf) = create_shelf();
        let result = shelf.open_index(&env, &catalog, "a:b", &IndexOptions::default());
        assert!(matches!(result, Err(CupboardError::InvalidName { .. })));
    }

    #[test]
    fn stored_options_survive_reopen_of_index() {
        let (_temp, env, catalog, shelf) = create_shelf();

        shelf
            .open_index(&env, &catalog, "title", &IndexOptions::new().sorted_duplicates(true))
            .unwrap();
        shelf.close_indices(&env, &catalog, false).unwrap();
        assert_eq!(shelf.index_kind("title"), None);

        // Reopen without a request: stored options decide.
        shelf
            .open_index(&env, &catalog, "title", &IndexOptions::default())
            .unwrap();
        assert_eq!(shelf.index_kind("title"), Some(FieldIndex::Any));
    }

    #[test]
    fn close_indices_with_remove_deletes_databases() {
        let (_temp, env, catalog, shelf) = create_shelf();

        shelf
            .open_index(&env, &catalog, "title", &IndexOptions::new().sorted_duplicates(true))
            .unwrap();
        assert!(env
            .database_names()
            .unwrap()
            .contains(&"books:title".to_string()));

        shelf.close_indices(&env, &catalog, true).unwrap();
        assert!(!env
            .database_names()
            .unwrap()
            .contains(&"books:title".to_string()));
        assert!(catalog.index_options("books", "title").unwrap().is_none());
    }

    #[test]
    fn key_creator_extracts_encoded_field() {
        let mut record = Record::new();
        record.assoc("title", "A");
        let bytes = record.encode().unwrap();

        let creator = key_creator_for("title");
        let key = creator(b"pk", &bytes).unwrap();
        assert_eq!(key, Value::from("A").encode_key());

        // Records without the field do not participate.
        assert!(creator(b"pk", &Record::new().encode().unwrap()).is_none());
    }
}
