//! Persistence operations: save, retrieve, assoc, dissoc, delete.

use crate::config::{IndexOptions, QueryOptions, ShelfOptions};
use crate::cupboard::{Cupboard, DEFAULT_SHELF};
use crate::error::{CupboardError, CupboardResult};
use crate::query::{Clause, RecordStream};
use crate::record::Record;
use crate::shape::{FieldIndex, Shape};
use crate::txn::Txn;
use crate::value::Value;
use tracing::debug;

/// Options for [`Cupboard::make_instance`].
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Save the instance immediately (the default).
    pub save: bool,
    /// Shelf to save to; defaults to the `_default` shelf.
    pub shelf: Option<String>,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            save: true,
            shelf: None,
        }
    }
}

impl InstanceOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the instance is saved immediately.
    #[must_use]
    pub const fn save(mut self, value: bool) -> Self {
        self.save = value;
        self
    }

    /// Sets the target shelf.
    #[must_use]
    pub fn shelf(mut self, name: impl Into<String>) -> Self {
        self.shelf = Some(name.into());
        self
    }
}

/// Options for [`Cupboard::save`].
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Shelf override; defaults to the record's own shelf, then to
    /// `_default`.
    pub shelf: Option<String>,
}

impl SaveOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the shelf override.
    #[must_use]
    pub fn shelf(mut self, name: impl Into<String>) -> Self {
        self.shelf = Some(name.into());
        self
    }
}

/// Options for [`Cupboard::retrieve`].
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    /// Shelf to search; defaults to the `_default` shelf.
    pub shelf: Option<String>,
}

impl RetrieveOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the shelf to search.
    #[must_use]
    pub fn shelf(mut self, name: impl Into<String>) -> Self {
        self.shelf = Some(name.into());
        self
    }
}

impl Cupboard {
    /// Creates a record instance of a shape and, unless `save` is turned
    /// off, saves it immediately under the caller's transaction.
    pub fn make_instance<I, K>(
        &self,
        shape: &Shape,
        fields: I,
        options: &InstanceOptions,
        txn: Option<&mut Txn>,
    ) -> CupboardResult<Record>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut record = shape.instantiate(fields);
        if let Some(shelf) = &options.shelf {
            record.meta.shelf = Some(shelf.clone());
        }
        if options.save {
            self.save(&mut record, &SaveOptions::default(), txn)?;
        }
        Ok(record)
    }

    /// Saves a record to its shelf.
    ///
    /// The target shelf is the caller's override, then the record's own
    /// shelf, then `_default`. Every index named in the record's metadata
    /// is opened first (unique indices without duplicates, any indices
    /// with), establishing indices lazily on the first save that uses
    /// them. Metadata is preserved, so saving again updates in place.
    pub fn save(
        &self,
        record: &mut Record,
        options: &SaveOptions,
        txn: Option<&mut Txn>,
    ) -> CupboardResult<()> {
        self.ensure_open()?;

        let shelf_name = options
            .shelf
            .clone()
            .or_else(|| record.meta.shelf.clone())
            .unwrap_or_else(|| DEFAULT_SHELF.to_string());
        let shelf = self.get_shelf(&shelf_name, &ShelfOptions::default())?;

        for field in &record.meta.unique_indexes {
            shelf.open_index(
                self.env(),
                self.catalog(),
                field,
                &IndexOptions::new().sorted_duplicates(false),
            )?;
        }
        for field in &record.meta.any_indexes {
            shelf.open_index(
                self.env(),
                self.catalog(),
                field,
                &IndexOptions::new().sorted_duplicates(true),
            )?;
        }

        record.meta.shelf = Some(shelf_name.clone());
        let payload = record.encode()?;
        let key = record.primary_key();

        let outcome = shelf
            .primary()
            .put(key.as_bytes(), &payload, txn.map(|t| &mut t.inner))?;
        if !outcome.is_success() {
            return Err(CupboardError::storage_failure(format!(
                "save to shelf {shelf_name:?} did not succeed"
            )));
        }
        debug!(shelf = %shelf_name, key = %key, "saved record");
        Ok(())
    }

    /// Retrieves records whose indexed `field` equals `value`.
    ///
    /// On a unique index the stream yields at most one record; on an any
    /// index it yields every match lazily, sharing the query machinery's
    /// cursor-ownership guarantee. An unindexed field is an error.
    pub fn retrieve<'a>(
        &self,
        field: &str,
        value: &Value,
        options: &RetrieveOptions,
        txn: Option<&'a Txn>,
    ) -> CupboardResult<RecordStream<'a>> {
        self.ensure_open()?;

        let shelf_name = options.shelf.as_deref().unwrap_or(DEFAULT_SHELF);
        let shelf = self.get_shelf(shelf_name, &ShelfOptions::default())?;

        match shelf.index_kind(field) {
            Some(FieldIndex::Unique) => {
                let guard = shelf.unique_indexes.read();
                let secondary =
                    guard
                        .get(field)
                        .ok_or_else(|| CupboardError::UnindexedField {
                            shelf: shelf_name.to_string(),
                            field: field.to_string(),
                        })?;
                let record = match secondary
                    .get(&value.encode_key(), txn.map(|t| &t.inner))?
                {
                    Some((_pkey, bytes)) => Some(Record::decode(&bytes)?),
                    None => None,
                };
                drop(guard);
                Ok(RecordStream::single(shelf, record))
            }
            Some(FieldIndex::Any) => self.query_stream(
                &[Clause::eq(field, value.clone())],
                &QueryOptions::new().shelf(shelf_name),
                txn,
            ),
            Some(FieldIndex::None) | None => Err(CupboardError::UnindexedField {
                shelf: shelf_name.to_string(),
                field: field.to_string(),
            }),
        }
    }

    /// Retrieves at most one record whose indexed `field` equals `value`.
    pub fn retrieve_one(
        &self,
        field: &str,
        value: &Value,
        options: &RetrieveOptions,
        txn: Option<&Txn>,
    ) -> CupboardResult<Option<Record>> {
        let mut stream = self.retrieve(field, value, options, txn)?;
        stream.next().transpose()
    }

    /// Sets fields on a record and saves it; the primary key and index
    /// metadata are preserved, so this is an in-place update.
    pub fn assoc<I, K>(
        &self,
        record: &mut Record,
        fields: I,
        txn: Option<&mut Txn>,
    ) -> CupboardResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (field, value) in fields {
            record.assoc(field, value);
        }
        self.save(record, &SaveOptions::default(), txn)
    }

    /// Removes fields from a record and saves it.
    pub fn dissoc(
        &self,
        record: &mut Record,
        fields: &[&str],
        txn: Option<&mut Txn>,
    ) -> CupboardResult<()> {
        for field in fields {
            record.dissoc(field);
        }
        self.save(record, &SaveOptions::default(), txn)
    }

    /// Deletes a record from its shelf.
    ///
    /// Secondary index entries are maintained by the storage engine,
    /// symmetrically with [`Cupboard::save`].
    pub fn delete(&self, record: &Record, txn: Option<&mut Txn>) -> CupboardResult<()> {
        self.ensure_open()?;

        let shelf_name = record
            .meta
            .shelf
            .clone()
            .unwrap_or_else(|| DEFAULT_SHELF.to_string());
        let shelf = self.get_shelf(&shelf_name, &ShelfOptions::default())?;

        let key = record.primary_key();
        let outcome = shelf
            .primary()
            .delete(key.as_bytes(), txn.map(|t| &mut t.inner))?;
        if !outcome.is_success() {
            return Err(CupboardError::storage_failure(format!(
                "record {key} is not present on shelf {shelf_name:?}"
            )));
        }
        debug!(shelf = %shelf_name, key = %key, "deleted record");
        Ok(())
    }
}
