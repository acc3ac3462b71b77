//! Cupboard lifecycle: the persistence environment and its shelves.

use crate::catalog::{self, Catalog, StoredShelfOptions, CATALOG_NAME, NAME_SEPARATOR};
use crate::config::{CupboardConfig, IndexOptions, ShelfOptions};
use crate::error::{CupboardError, CupboardResult};
use crate::shelf::Shelf;
use cupboard_store::{DatabaseConfig, Environment, EnvironmentConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the shelf opened eagerly in a fresh cupboard.
pub const DEFAULT_SHELF: &str = "_default";

/// A persistence environment rooted in a directory.
///
/// The cupboard owns the storage environment, the catalog database, and
/// every open [`Shelf`]. Shelves open lazily on first use and are
/// re-opened automatically when an existing cupboard is opened.
///
/// # Example
///
/// ```rust,ignore
/// use cupboard_core::{Cupboard, CupboardConfig};
///
/// let cb = Cupboard::open(dir, CupboardConfig::default())?;
/// let shelf = cb.get_shelf("books", &ShelfOptions::default())?;
/// cb.close()?;
/// ```
pub struct Cupboard {
    env: Environment,
    catalog: Catalog,
    shelves: Mutex<HashMap<String, Arc<Shelf>>>,
    closed: AtomicBool,
}

impl Cupboard {
    /// Opens a cupboard rooted at `dir`.
    ///
    /// A missing directory is created. An empty directory produces a fresh
    /// environment with the `_default` shelf; a non-empty one is opened
    /// and every existing shelf (and its indices) re-opened.
    ///
    /// # Errors
    ///
    /// - [`CupboardError::InvalidArgument`] if `dir` is a regular file
    /// - [`CupboardError::Io`] if the directory cannot be created
    /// - Storage errors from the environment; any failure after the
    ///   environment opens tears down already-acquired resources in
    ///   reverse order before propagating
    pub fn open(dir: &Path, config: CupboardConfig) -> CupboardResult<Self> {
        if dir.is_file() {
            return Err(CupboardError::invalid_argument(format!(
                "cupboard path is a regular file: {}",
                dir.display()
            )));
        }
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let env_new = dir.read_dir()?.next().is_none();

        let env = Environment::open(
            dir,
            EnvironmentConfig::new()
                .allow_create(env_new)
                .transactional(config.transactional),
        )?;

        let catalog = match Catalog::open(&env, env_new) {
            Ok(catalog) => catalog,
            Err(err) => {
                let _ = env.close();
                return Err(err);
            }
        };

        let cupboard = Self {
            env,
            catalog,
            shelves: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };

        if let Err(err) = cupboard.bootstrap(env_new) {
            let _ = cupboard.close();
            return Err(err);
        }

        info!(dir = %dir.display(), env_new, "opened cupboard");
        Ok(cupboard)
    }

    /// Opens the default shelf on a fresh environment and re-opens every
    /// shelf already present.
    fn bootstrap(&self, env_new: bool) -> CupboardResult<()> {
        if env_new {
            self.get_shelf(DEFAULT_SHELF, &ShelfOptions::default())?;
        }
        for name in self.env.database_names()? {
            if name == CATALOG_NAME || name.contains(NAME_SEPARATOR) {
                continue;
            }
            self.get_shelf(&name, &ShelfOptions::default())?;
        }
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> CupboardResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CupboardError::invalid_argument("cupboard is closed"));
        }
        Ok(())
    }

    /// Returns the storage environment.
    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Opens (or returns) a shelf by name.
    ///
    /// Stored catalog options are merged with the caller's options
    /// (`read_only` is the only caller-merged one) and persisted back.
    /// Every index recorded for the shelf is re-opened.
    pub fn get_shelf(&self, name: &str, options: &ShelfOptions) -> CupboardResult<Arc<Shelf>> {
        self.ensure_open()?;
        catalog::validate_shelf_name(name)?;

        if options.force_reopen {
            self.close_shelf(name)?;
        }

        let mut shelves = self.shelves.lock();
        if let Some(shelf) = shelves.get(name) {
            return Ok(Arc::clone(shelf));
        }

        let stored = self.catalog.shelf_options(name)?.unwrap_or_default();
        let read_only = options.read_only || stored.read_only;

        let primary = self.env.open_database(
            name,
            DatabaseConfig::new()
                .allow_create(true)
                .sorted_duplicates(false)
                .read_only(read_only),
        )?;
        let shelf = Arc::new(Shelf::new(name.to_string(), primary));

        if let Err(err) = self.finish_shelf_open(&shelf, name, read_only) {
            let _ = shelf.close_indices(&self.env, &self.catalog, false);
            let _ = shelf.primary.close();
            return Err(err);
        }

        debug!(shelf = name, read_only, "opened shelf");
        shelves.insert(name.to_string(), Arc::clone(&shelf));
        Ok(shelf)
    }

    /// Persists shelf options and re-opens indices discovered by
    /// enumeration.
    fn finish_shelf_open(
        &self,
        shelf: &Arc<Shelf>,
        name: &str,
        read_only: bool,
    ) -> CupboardResult<()> {
        self.catalog
            .set_shelf_options(name, StoredShelfOptions { read_only })?;

        let prefix = format!("{name}{NAME_SEPARATOR}");
        for db_name in self.env.database_names()? {
            if let Some(index) = db_name.strip_prefix(&prefix) {
                shelf.open_index(&self.env, &self.catalog, index, &IndexOptions::default())?;
            }
        }
        Ok(())
    }

    /// Closes a shelf: its indices first, then the primary database.
    ///
    /// Closing a shelf that is not open is a no-op.
    pub fn close_shelf(&self, name: &str) -> CupboardResult<()> {
        self.ensure_open()?;
        self.close_shelf_impl(name, false)
    }

    /// Removes a shelf: closes it and deletes the primary database, every
    /// index database, and all of their catalog entries.
    pub fn remove_shelf(&self, name: &str) -> CupboardResult<()> {
        self.ensure_open()?;
        // Open first so that all of its indices are registered and removed.
        self.get_shelf(name, &ShelfOptions::default())?;
        self.close_shelf_impl(name, true)
    }

    fn close_shelf_impl(&self, name: &str, remove: bool) -> CupboardResult<()> {
        let shelf = self.shelves.lock().remove(name);
        let shelf = match shelf {
            Some(shelf) => shelf,
            None => return Ok(()),
        };

        let mut first_error = shelf
            .close_indices(&self.env, &self.catalog, remove)
            .err();
        if let Err(err) = shelf.primary.close() {
            first_error.get_or_insert(CupboardError::from(err));
        }

        if remove {
            match self.env.remove_database(name) {
                Ok(true) => {}
                Ok(false) => {
                    first_error.get_or_insert(CupboardError::storage_failure(format!(
                        "shelf database {name:?} was not removed"
                    )));
                }
                Err(err) => {
                    first_error.get_or_insert(CupboardError::from(err));
                }
            }
            if let Err(err) = self.catalog.remove_shelf_options(name) {
                first_error.get_or_insert(err);
            }
        }

        debug!(shelf = name, remove, "closed shelf");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Lists the shelves in the environment: every database name that is
    /// not the catalog and contains no `:` separator.
    pub fn list_shelves(&self) -> CupboardResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .env
            .database_names()?
            .into_iter()
            .filter(|name| name != CATALOG_NAME && !name.contains(NAME_SEPARATOR))
            .collect())
    }

    /// Closes the cupboard: every shelf (indices before primary), then
    /// the catalog, then the environment. A second close is a no-op.
    pub fn close(&self) -> CupboardResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shelves: Vec<(String, Arc<Shelf>)> = self.shelves.lock().drain().collect();
        let mut first_error: Option<CupboardError> = None;

        for (_, shelf) in &shelves {
            if let Err(err) = shelf.close_indices(&self.env, &self.catalog, false) {
                first_error.get_or_insert(err);
            }
            if let Err(err) = shelf.primary.close() {
                first_error.get_or_insert(CupboardError::from(err));
            }
        }
        if let Err(err) = self.catalog.close() {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.env.close() {
            first_error.get_or_insert(CupboardError::from(err));
        }

        info!("closed cupboard");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Cupboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cupboard")
            .field("shelves", &self.shelves.lock().keys().collect::<Vec<_>>())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for Cupboard {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens a cupboard, runs `body`, and guarantees close on all exit paths.
pub fn with_cupboard<T, F>(dir: &Path, config: CupboardConfig, body: F) -> CupboardResult<T>
where
    F: FnOnce(&Cupboard) -> CupboardResult<T>,
{
    let cupboard = Cupboard::open(dir, config)?;
    match body(&cupboard) {
        Ok(value) => {
            cupboard.close()?;
            Ok(value)
        }
        Err(err) => {
            let _ = cupboard.close();
            Err(err)
        }
    }
}
