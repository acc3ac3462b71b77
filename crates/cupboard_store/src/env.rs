//! Storage environment rooted in a directory.
//!
//! This module handles the on-disk layout of an environment:
//!
//! ```text
//! <dir>/
//! ├─ LOCK            # advisory lock for exclusive access
//! ├─ REGISTRY        # database registry (names, file ids, flags)
//! └─ db-000001.dat   # one data file per database
//! ```
//!
//! The LOCK file ensures only one process operates on the environment at a
//! time. Database files are rewritten atomically (write to a temporary
//! file, rename, fsync the directory) whenever a commit dirties them.

use crate::database::DbShared;
use crate::error::{StoreError, StoreResult};
use crate::registry::Registry;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const REGISTRY_FILE: &str = "REGISTRY";
const REGISTRY_TEMP: &str = "REGISTRY.tmp";

/// Magic bytes for database data files.
const DATA_MAGIC: [u8; 4] = *b"CBDB";

/// Current data file format version.
const DATA_VERSION: u16 = 1;

/// Configuration for opening an environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Whether missing environment state may be created.
    pub allow_create: bool,
    /// Whether the environment supports transactions.
    pub transactional: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            allow_create: true,
            transactional: true,
        }
    }
}

impl EnvironmentConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether missing environment state may be created.
    #[must_use]
    pub const fn allow_create(mut self, value: bool) -> Self {
        self.allow_create = value;
        self
    }

    /// Sets whether the environment supports transactions.
    #[must_use]
    pub const fn transactional(mut self, value: bool) -> Self {
        self.transactional = value;
        self
    }
}

/// Shared environment state.
pub(crate) struct EnvInner {
    /// Root directory path.
    pub(crate) dir: PathBuf,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
    /// Whether transactions are supported.
    pub(crate) transactional: bool,
    /// Persistent database registry.
    pub(crate) registry: Mutex<Registry>,
    /// Resident database data, keyed by name.
    ///
    /// Data stays resident after a handle is closed so that a later reopen
    /// observes the same state without a disk round-trip.
    pub(crate) resident: Mutex<HashMap<String, Arc<DbShared>>>,
    /// Per-key write locks: `(file id, key) -> holding transaction`.
    pub(crate) locks: Mutex<HashMap<(u64, Vec<u8>), u64>>,
    /// Next transaction ID.
    pub(crate) next_txn_id: AtomicU64,
    /// Count of open database and secondary handles.
    pub(crate) open_databases: AtomicUsize,
    /// Count of open cursors.
    pub(crate) open_cursors: AtomicUsize,
    /// Count of transactions that are currently open.
    pub(crate) active_txns: AtomicUsize,
    /// Whether the environment has been closed.
    pub(crate) closed: AtomicBool,
}

impl EnvInner {
    pub(crate) fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::EnvironmentClosed)
        } else {
            Ok(())
        }
    }

    fn db_file_path(&self, file_id: u64) -> PathBuf {
        self.dir.join(format!("db-{file_id:06}.dat"))
    }

    /// Loads a database's data into residence, or returns the resident copy.
    ///
    /// Returns `None` if the database is not registered.
    pub(crate) fn load_database(&self, name: &str) -> StoreResult<Option<Arc<DbShared>>> {
        if let Some(shared) = self.resident.lock().get(name) {
            return Ok(Some(Arc::clone(shared)));
        }

        let entry = match self.registry.lock().get(name) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let path = self.db_file_path(entry.file_id);
        let entries = if path.exists() {
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            decode_data_file(&data)?
        } else {
            BTreeMap::new()
        };

        let shared = Arc::new(DbShared {
            name: name.to_string(),
            file_id: entry.file_id,
            duplicates: entry.duplicates,
            entries: RwLock::new(entries),
            secondaries: RwLock::new(Vec::new()),
        });
        self.resident
            .lock()
            .insert(name.to_string(), Arc::clone(&shared));
        Ok(Some(shared))
    }

    /// Registers and loads a new database.
    pub(crate) fn create_database(
        &self,
        name: &str,
        duplicates: bool,
    ) -> StoreResult<Arc<DbShared>> {
        let entry = self.registry.lock().register(name, duplicates);
        self.persist_registry()?;

        let shared = Arc::new(DbShared {
            name: name.to_string(),
            file_id: entry.file_id,
            duplicates: entry.duplicates,
            entries: RwLock::new(BTreeMap::new()),
            secondaries: RwLock::new(Vec::new()),
        });
        self.resident
            .lock()
            .insert(name.to_string(), Arc::clone(&shared));
        debug!(name, duplicates, "created database");
        Ok(shared)
    }

    /// Persists a database's data file atomically.
    pub(crate) fn persist_database(&self, shared: &DbShared) -> StoreResult<()> {
        let path = self.db_file_path(shared.file_id);
        let temp = path.with_extension("dat.tmp");

        let data = encode_data_file(&shared.entries.read());
        let mut file = File::create(&temp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &path)?;
        self.sync_directory()?;
        Ok(())
    }

    /// Persists the registry atomically.
    pub(crate) fn persist_registry(&self) -> StoreResult<()> {
        let path = self.dir.join(REGISTRY_FILE);
        let temp = self.dir.join(REGISTRY_TEMP);

        let data = self.registry.lock().encode();
        let mut file = File::create(&temp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &path)?;
        self.sync_directory()?;
        Ok(())
    }

    /// Acquires the write lock on `(file_id, key)` for a transaction.
    ///
    /// A lock held by another transaction fails immediately with
    /// [`StoreError::Deadlock`]; re-acquisition by the holder is a no-op.
    pub(crate) fn lock_key(&self, txn_id: u64, file_id: u64, key: &[u8]) -> StoreResult<bool> {
        let mut locks = self.locks.lock();
        match locks.get(&(file_id, key.to_vec())) {
            Some(&holder) if holder == txn_id => Ok(false),
            Some(&holder) => Err(StoreError::Deadlock { holder }),
            None => {
                locks.insert((file_id, key.to_vec()), txn_id);
                Ok(true)
            }
        }
    }

    /// Releases every lock held by a transaction.
    pub(crate) fn release_locks(&self, locked: &[(u64, Vec<u8>)]) {
        let mut locks = self.locks.lock();
        for entry in locked {
            locks.remove(entry);
        }
    }

    /// Syncs the environment directory so renames are durable.
    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        let dir = File::open(&self.dir)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// A storage environment.
///
/// The environment owns the database registry, the lock table, and the
/// on-disk representation of every database. Handles are cheap to clone;
/// all clones share state.
#[derive(Clone)]
pub struct Environment {
    pub(crate) inner: Arc<EnvInner>,
}

impl Environment {
    /// Opens an environment rooted at `dir`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::EnvironmentLocked`] if another process holds the lock
    /// - [`StoreError::InvalidFormat`] if the directory holds no registry
    ///   and `allow_create` is false, or the registry is corrupt
    /// - I/O errors from the file system
    pub fn open(dir: &Path, config: EnvironmentConfig) -> StoreResult<Self> {
        if !dir.exists() {
            if !config.allow_create {
                return Err(StoreError::invalid_format(format!(
                    "environment directory does not exist: {}",
                    dir.display()
                )));
            }
            fs::create_dir_all(dir)?;
        }

        let lock_path = dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::EnvironmentLocked);
        }

        let registry_path = dir.join(REGISTRY_FILE);
        let registry = if registry_path.exists() {
            let mut data = Vec::new();
            File::open(&registry_path)?.read_to_end(&mut data)?;
            Registry::decode(&data)?
        } else {
            if !config.allow_create {
                return Err(StoreError::invalid_format(format!(
                    "no registry in environment directory: {}",
                    dir.display()
                )));
            }
            Registry::new()
        };

        debug!(dir = %dir.display(), databases = registry.databases.len(), "opened environment");

        Ok(Self {
            inner: Arc::new(EnvInner {
                dir: dir.to_path_buf(),
                _lock_file: lock_file,
                transactional: config.transactional,
                registry: Mutex::new(registry),
                resident: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                next_txn_id: AtomicU64::new(1),
                open_databases: AtomicUsize::new(0),
                open_cursors: AtomicUsize::new(0),
                active_txns: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the names of all registered databases, sorted.
    pub fn database_names(&self) -> StoreResult<Vec<String>> {
        self.inner.ensure_open()?;
        Ok(self.inner.registry.lock().names())
    }

    /// Removes a database and its data file.
    ///
    /// Returns `true` if the database was registered. Any open handle on
    /// the database should be closed first; its resident data is dropped.
    pub fn remove_database(&self, name: &str) -> StoreResult<bool> {
        self.inner.ensure_open()?;

        let entry = match self.inner.registry.lock().remove(name) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        self.inner.resident.lock().remove(name);
        self.inner.persist_registry()?;

        let path = self.inner.db_file_path(entry.file_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        debug!(name, "removed database");
        Ok(true)
    }

    /// Closes the environment.
    ///
    /// All database and cursor handles must be closed first. Resident
    /// database data and the registry are flushed to disk.
    pub fn close(&self) -> StoreResult<()> {
        self.inner.ensure_open()?;

        let databases = self.inner.open_databases.load(Ordering::SeqCst);
        let cursors = self.inner.open_cursors.load(Ordering::SeqCst);
        if databases > 0 || cursors > 0 {
            return Err(StoreError::HandlesStillOpen { databases, cursors });
        }

        for shared in self.inner.resident.lock().values() {
            self.inner.persist_database(shared)?;
        }
        self.inner.persist_registry()?;

        self.inner.closed.store(true, Ordering::SeqCst);
        debug!(dir = %self.inner.dir.display(), "closed environment");
        Ok(())
    }

    /// Whether the environment supports transactions.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.inner.transactional
    }

    /// Number of open database and secondary handles.
    #[must_use]
    pub fn open_database_count(&self) -> usize {
        self.inner.open_databases.load(Ordering::SeqCst)
    }

    /// Number of open cursors.
    #[must_use]
    pub fn open_cursor_count(&self) -> usize {
        self.inner.open_cursors.load(Ordering::SeqCst)
    }

    /// Number of transactions currently open.
    #[must_use]
    pub fn active_transaction_count(&self) -> usize {
        self.inner.active_txns.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("dir", &self.inner.dir)
            .field("open_databases", &self.open_database_count())
            .field("open_cursors", &self.open_cursor_count())
            .finish_non_exhaustive()
    }
}

/// Encodes a database's entries to the data file format.
fn encode_data_file(entries: &BTreeMap<Vec<u8>, Vec<Vec<u8>>>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&DATA_MAGIC);
    buf.extend_from_slice(&DATA_VERSION.to_le_bytes());

    let count = u32::try_from(entries.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&count.to_le_bytes());

    for (key, values) in entries {
        let key_len = u32::try_from(key.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(key);

        let val_count = u32::try_from(values.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&val_count.to_le_bytes());
        for value in values {
            let val_len = u32::try_from(value.len()).unwrap_or(u32::MAX);
            buf.extend_from_slice(&val_len.to_le_bytes());
            buf.extend_from_slice(value);
        }
    }

    buf
}

/// Decodes a database data file.
fn decode_data_file(data: &[u8]) -> StoreResult<BTreeMap<Vec<u8>, Vec<Vec<u8>>>> {
    let mut cursor = 0;

    if data.len() < 4 || data[0..4] != DATA_MAGIC {
        return Err(StoreError::invalid_format("invalid data file magic"));
    }
    cursor += 4;

    let version = read_u16(data, &mut cursor)?;
    if version > DATA_VERSION {
        return Err(StoreError::invalid_format(format!(
            "unsupported data file version: {version}"
        )));
    }

    let count = read_u32(data, &mut cursor)? as usize;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let key = read_bytes(data, &mut cursor)?;
        let val_count = read_u32(data, &mut cursor)? as usize;
        let mut values = Vec::with_capacity(val_count);
        for _ in 0..val_count {
            values.push(read_bytes(data, &mut cursor)?);
        }
        entries.insert(key, values);
    }

    Ok(entries)
}

fn read_u16(data: &[u8], cursor: &mut usize) -> StoreResult<u16> {
    if *cursor + 2 > data.len() {
        return Err(StoreError::invalid_format("data file too short"));
    }
    let v = u16::from_le_bytes([data[*cursor], data[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> StoreResult<u32> {
    if *cursor + 4 > data.len() {
        return Err(StoreError::invalid_format("data file too short"));
    }
    let v = u32::from_le_bytes([
        data[*cursor],
        data[*cursor + 1],
        data[*cursor + 2],
        data[*cursor + 3],
    ]);
    *cursor += 4;
    Ok(v)
}

fn read_bytes(data: &[u8], cursor: &mut usize) -> StoreResult<Vec<u8>> {
    let len = read_u32(data, cursor)? as usize;
    if *cursor + len > data.len() {
        return Err(StoreError::invalid_format("data file too short"));
    }
    let bytes = data[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("env");

        let env = Environment::open(&dir, EnvironmentConfig::default()).unwrap();
        assert!(dir.is_dir());
        assert!(env.database_names().unwrap().is_empty());
    }

    #[test]
    fn open_without_create_fails_on_missing() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("missing");

        let result = Environment::open(&dir, EnvironmentConfig::new().allow_create(false));
        assert!(result.is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("env");

        let _env = Environment::open(&dir, EnvironmentConfig::default()).unwrap();
        let result = Environment::open(&dir, EnvironmentConfig::default());
        assert!(matches!(result, Err(StoreError::EnvironmentLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("env");

        {
            let env = Environment::open(&dir, EnvironmentConfig::default()).unwrap();
            env.close().unwrap();
        }
        let _env = Environment::open(&dir, EnvironmentConfig::default()).unwrap();
    }

    #[test]
    fn data_file_roundtrip() {
        let mut entries = BTreeMap::new();
        entries.insert(b"a".to_vec(), vec![b"1".to_vec()]);
        entries.insert(b"b".to_vec(), vec![b"2".to_vec(), b"3".to_vec()]);

        let decoded = decode_data_file(&encode_data_file(&entries)).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn data_file_invalid_magic() {
        assert!(decode_data_file(b"NOPE").is_err());
    }

    #[test]
    fn registry_persists_across_reopen() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("env");

        {
            let env = Environment::open(&dir, EnvironmentConfig::default()).unwrap();
            env.inner.registry.lock().register("books", false);
            env.inner.persist_registry().unwrap();
            env.close().unwrap();
        }

        let env = Environment::open(&dir, EnvironmentConfig::default()).unwrap();
        assert_eq!(env.database_names().unwrap(), vec!["books"]);
    }

    #[test]
    fn close_flushes_and_marks_closed() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("env");

        let env = Environment::open(&dir, EnvironmentConfig::default()).unwrap();
        env.close().unwrap();
        assert!(matches!(
            env.database_names(),
            Err(StoreError::EnvironmentClosed)
        ));
    }
}
