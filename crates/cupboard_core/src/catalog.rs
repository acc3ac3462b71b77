//! Persistent catalog of shelves and indices.
//!
//! The catalog is a reserved primary database (`_shelves`) storing, per
//! shelf, the shelf's options under the shelf name and, per index, the
//! index options under the composite key `"<shelf>:<index>"`. The `:`
//! separator is therefore reserved and may not appear in shelf or index
//! names.

use crate::error::{CupboardError, CupboardResult};
use cupboard_store::{Database, DatabaseConfig, Environment};
use serde::{Deserialize, Serialize};

/// Name of the reserved catalog database.
pub const CATALOG_NAME: &str = "_shelves";

/// Reserved separator between shelf and index names in catalog keys.
pub const NAME_SEPARATOR: char = ':';

/// Validates a shelf name against the reserved names and characters.
pub fn validate_shelf_name(name: &str) -> CupboardResult<()> {
    if name.is_empty() {
        return Err(CupboardError::invalid_name(name, "shelf name is empty"));
    }
    if name == CATALOG_NAME {
        return Err(CupboardError::invalid_name(
            name,
            "shelf name is reserved for the catalog",
        ));
    }
    if name.contains(NAME_SEPARATOR) {
        return Err(CupboardError::invalid_name(
            name,
            "shelf name contains the reserved ':' separator",
        ));
    }
    Ok(())
}

/// Validates an index name against the reserved characters.
pub fn validate_index_name(name: &str) -> CupboardResult<()> {
    if name.is_empty() {
        return Err(CupboardError::invalid_name(name, "index name is empty"));
    }
    if name.contains(NAME_SEPARATOR) {
        return Err(CupboardError::invalid_name(
            name,
            "index name contains the reserved ':' separator",
        ));
    }
    Ok(())
}

/// Builds the composite catalog key for an index.
#[must_use]
pub fn composite_name(shelf: &str, index: &str) -> String {
    format!("{shelf}{NAME_SEPARATOR}{index}")
}

/// Shelf options as stored in the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredShelfOptions {
    pub read_only: bool,
}

/// Index options as stored in the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredIndexOptions {
    pub sorted_duplicates: bool,
}

/// Handle to the catalog database.
pub(crate) struct Catalog {
    db: Database,
}

impl Catalog {
    /// Opens the catalog database in an environment.
    pub(crate) fn open(env: &Environment, allow_create: bool) -> CupboardResult<Self> {
        let db = env.open_database(
            CATALOG_NAME,
            DatabaseConfig::new()
                .allow_create(allow_create)
                .sorted_duplicates(false),
        )?;
        Ok(Self { db })
    }

    pub(crate) fn shelf_options(&self, name: &str) -> CupboardResult<Option<StoredShelfOptions>> {
        self.read(name.as_bytes())
    }

    pub(crate) fn set_shelf_options(
        &self,
        name: &str,
        options: StoredShelfOptions,
    ) -> CupboardResult<()> {
        self.write(name.as_bytes(), &options)
    }

    pub(crate) fn remove_shelf_options(&self, name: &str) -> CupboardResult<()> {
        self.db.delete(name.as_bytes(), None)?;
        Ok(())
    }

    pub(crate) fn index_options(
        &self,
        shelf: &str,
        index: &str,
    ) -> CupboardResult<Option<StoredIndexOptions>> {
        self.read(composite_name(shelf, index).as_bytes())
    }

    pub(crate) fn set_index_options(
        &self,
        shelf: &str,
        index: &str,
        options: StoredIndexOptions,
    ) -> CupboardResult<()> {
        self.write(composite_name(shelf, index).as_bytes(), &options)
    }

    pub(crate) fn remove_index_options(&self, shelf: &str, index: &str) -> CupboardResult<()> {
        self.db
            .delete(composite_name(shelf, index).as_bytes(), None)?;
        Ok(())
    }

    /// Returns every catalog key, for diagnostics and tests.
    pub(crate) fn entry_names(&self) -> CupboardResult<Vec<String>> {
        let cursor = self.db.open_cursor(None)?;
        let mut names = Vec::new();
        for (key, _) in cursor.scan(b"", cupboard_store::ScanComparison::Ge) {
            let name = String::from_utf8(key)
                .map_err(|_| CupboardError::codec("catalog key is not UTF-8"))?;
            names.push(name);
        }
        Ok(names)
    }

    /// Closes the catalog database handle.
    pub(crate) fn close(&self) -> CupboardResult<()> {
        self.db.close()?;
        Ok(())
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, key: &[u8]) -> CupboardResult<Option<T>> {
        match self.db.get(key, None)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|err| CupboardError::codec(err.to_string())),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, key: &[u8], value: &T) -> CupboardResult<()> {
        let bytes =
            bincode::serialize(value).map_err(|err| CupboardError::codec(err.to_string()))?;
        let outcome = self.db.put(key, &bytes, None)?;
        if !outcome.is_success() {
            return Err(CupboardError::storage_failure(
                "catalog write did not succeed",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cupboard_store::EnvironmentConfig;
    use tempfile::tempdir;

    #[test]
    fn shelf_name_validation() {
        assert!(validate_shelf_name("books").is_ok());
        assert!(validate_shelf_name("").is_err());
        assert!(validate_shelf_name("_shelves").is_err());
        assert!(validate_shelf_name("a:b").is_err());
    }

    #[test]
    fn index_name_validation() {
        assert!(validate_index_name("title").is_ok());
        assert!(validate_index_name("").is_err());
        assert!(validate_index_name("a:b").is_err());
    }

    #[test]
    fn composite_key_format() {
        assert_eq!(composite_name("books", "title"), "books:title");
    }

    #[test]
    fn options_roundtrip() {
        let temp = tempdir().unwrap();
        let env = Environment::open(&temp.path().join("env"), EnvironmentConfig::default())
            .unwrap();
        let catalog = Catalog::open(&env, true).unwrap();

        assert!(catalog.shelf_options("books").unwrap().is_none());

        catalog
            .set_shelf_options("books", StoredShelfOptions { read_only: false })
            .unwrap();
        catalog
            .set_index_options(
                "books",
                "title",
                StoredIndexOptions {
                    sorted_duplicates: true,
                },
            )
            .unwrap();

        assert_eq!(
            catalog.shelf_options("books").unwrap(),
            Some(StoredShelfOptions { read_only: false })
        );
        assert_eq!(
            catalog.index_options("books", "title").unwrap(),
            Some(StoredIndexOptions {
                sorted_duplicates: true,
            })
        );
        assert_eq!(catalog.entry_names().unwrap(), vec!["books", "books:title"]);

        catalog.remove_index_options("books", "title").unwrap();
        catalog.remove_shelf_options("books").unwrap();
        assert!(catalog.entry_names().unwrap().is_empty());
    }
}
