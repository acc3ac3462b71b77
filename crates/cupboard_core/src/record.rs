//! Records and their persistence metadata.

use crate::error::{CupboardError, CupboardResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Primary key of a record.
///
/// Record IDs are 128-bit UUIDs that are:
/// - Unique within a shelf
/// - Assigned at instance creation
/// - Immutable for the life of the record, including across field updates
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId([u8; 16]);

impl RecordId {
    /// Creates a new random record ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Creates a record ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Creates a record ID from a slice.
    ///
    /// Returns `None` if the slice is not exactly 16 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() == 16 {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(slice);
            Some(Self(bytes))
        } else {
            None
        }
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.to_uuid())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

/// Persistence metadata carried by every record.
///
/// The metadata travels with the record through field updates so that a
/// later save is an in-place update rather than a new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// The record's primary key.
    pub primary_key: RecordId,
    /// Fields indexed with a unique index.
    pub unique_indexes: BTreeSet<String>,
    /// Fields indexed with an any (duplicates permitted) index.
    pub any_indexes: BTreeSet<String>,
    /// The shelf this record was last saved to, if any.
    pub shelf: Option<String>,
}

impl RecordMeta {
    /// Creates metadata with a fresh primary key and no indexed fields.
    #[must_use]
    pub fn new() -> Self {
        Self {
            primary_key: RecordId::new(),
            unique_indexes: BTreeSet::new(),
            any_indexes: BTreeSet::new(),
            shelf: None,
        }
    }
}

impl Default for RecordMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A record: named field values plus persistence metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Persistence metadata.
    pub meta: RecordMeta,
    /// Field name to value mapping.
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record with fresh metadata.
    #[must_use]
    pub fn new() -> Self {
        Self {
            meta: RecordMeta::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Returns the record's primary key.
    #[must_use]
    pub fn primary_key(&self) -> RecordId {
        self.meta.primary_key
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets a field value, preserving metadata.
    pub fn assoc(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Removes a field, preserving metadata.
    pub fn dissoc(&mut self, field: &str) -> &mut Self {
        self.fields.remove(field);
        self
    }

    /// Encodes the record (metadata and fields) for storage.
    pub fn encode(&self) -> CupboardResult<Vec<u8>> {
        bincode::serialize(self).map_err(|err| CupboardError::codec(err.to_string()))
    }

    /// Decodes a stored record.
    pub fn decode(bytes: &[u8]) -> CupboardResult<Self> {
        bincode::deserialize(bytes).map_err(|err| CupboardError::codec(err.to_string()))
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}
