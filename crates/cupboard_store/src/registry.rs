//! Persistent database registry.

use crate::error::{StoreError, StoreResult};
use std::collections::BTreeMap;

/// Magic bytes for the registry file.
pub const REGISTRY_MAGIC: [u8; 4] = *b"CBRG";

/// Current registry format version.
pub const REGISTRY_VERSION: u16 = 1;

/// Per-database registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseEntry {
    /// Stable file id, used to name the data file on disk.
    pub file_id: u64,
    /// Whether the database permits duplicate keys.
    pub duplicates: bool,
}

/// Registry of the databases in an environment.
///
/// The registry stores:
/// - The name of every database and its data file id
/// - Whether each database was created with duplicate keys permitted
///
/// The duplicates flag recorded here is the ground truth for a database's
/// configuration; open requests cannot change it.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    /// Database name to entry mapping (BTreeMap for deterministic
    /// serialization and sorted enumeration).
    pub databases: BTreeMap<String, DatabaseEntry>,
    /// Next file id to assign.
    pub next_file_id: u64,
}

impl Registry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            databases: BTreeMap::new(),
            next_file_id: 1,
        }
    }

    /// Registers a database, returning its entry.
    ///
    /// If the name is already registered the existing entry is returned
    /// unchanged.
    pub fn register(&mut self, name: &str, duplicates: bool) -> DatabaseEntry {
        if let Some(entry) = self.databases.get(name) {
            return *entry;
        }
        let entry = DatabaseEntry {
            file_id: self.next_file_id,
            duplicates,
        };
        self.next_file_id += 1;
        self.databases.insert(name.to_string(), entry);
        entry
    }

    /// Looks up a database by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<DatabaseEntry> {
        self.databases.get(name).copied()
    }

    /// Removes a database, returning its entry if it was registered.
    pub fn remove(&mut self, name: &str) -> Option<DatabaseEntry> {
        self.databases.remove(name)
    }

    /// Returns all database names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.databases.keys().cloned().collect()
    }

    /// Encodes the registry to bytes (deterministic).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&REGISTRY_MAGIC);
        buf.extend_from_slice(&REGISTRY_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.next_file_id.to_le_bytes());

        let count = u32::try_from(self.databases.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&count.to_le_bytes());

        for (name, entry) in &self.databases {
            let name_bytes = name.as_bytes();
            let name_len = u16::try_from(name_bytes.len()).unwrap_or(u16::MAX);
            buf.extend_from_slice(&name_len.to_le_bytes());
            buf.extend_from_slice(name_bytes);
            buf.extend_from_slice(&entry.file_id.to_le_bytes());
            buf.push(u8::from(entry.duplicates));
        }

        buf
    }

    /// Decodes a registry from bytes.
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        let mut cursor = 0;

        if data.len() < 4 || data[0..4] != REGISTRY_MAGIC {
            return Err(StoreError::invalid_format("invalid registry magic"));
        }
        cursor += 4;

        let version = read_u16(data, &mut cursor)?;
        if version > REGISTRY_VERSION {
            return Err(StoreError::invalid_format(format!(
                "unsupported registry version: {version}"
            )));
        }

        let next_file_id = read_u64(data, &mut cursor)?;
        let count = read_u32(data, &mut cursor)? as usize;

        let mut databases = BTreeMap::new();
        for _ in 0..count {
            let name_len = read_u16(data, &mut cursor)? as usize;
            if cursor + name_len > data.len() {
                return Err(StoreError::invalid_format("registry too short"));
            }
            let name = std::str::from_utf8(&data[cursor..cursor + name_len])
                .map_err(|_| StoreError::invalid_format("invalid database name"))?
                .to_string();
            cursor += name_len;

            let file_id = read_u64(data, &mut cursor)?;
            if cursor + 1 > data.len() {
                return Err(StoreError::invalid_format("registry too short"));
            }
            let duplicates = data[cursor] != 0;
            cursor += 1;

            databases.insert(
                name,
                DatabaseEntry {
                    file_id,
                    duplicates,
                },
            );
        }

        Ok(Self {
            databases,
            next_file_id,
        })
    }
}

fn read_u16(data: &[u8], cursor: &mut usize) -> StoreResult<u16> {
    if *cursor + 2 > data.len() {
        return Err(StoreError::invalid_format("registry too short"));
    }
    let v = u16::from_le_bytes([data[*cursor], data[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> StoreResult<u32> {
    if *cursor + 4 > data.len() {
        return Err(StoreError::invalid_format("registry too short"));
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

fn read_u64(data: &[u8], cursor: &mut usize) -> StoreResult<u64> {
    if *cursor + 8 > data.len() {
        return Err(StoreError::invalid_format("registry too short"));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[*cursor..*cursor + 8]);
    *cursor += 8;
    Ok(u64::from_le_bytes(bytes))
}
