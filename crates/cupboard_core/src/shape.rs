//! Record shapes: declared layouts with indexed fields.

use crate::record::Record;
use crate::value::Value;

/// How a shape field is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldIndex {
    /// Not indexed.
    #[default]
    None,
    /// Unique index: at most one record per value.
    Unique,
    /// Any index: duplicate values permitted.
    Any,
}

/// A declared field of a shape.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Field name. For indexed fields this is also the index name.
    pub name: String,
    /// How the field is indexed.
    pub index: FieldIndex,
}

/// A named record layout.
///
/// Shapes declare which fields exist and how they are indexed; instances
/// carry that classification in their persistence metadata.
///
/// # Example
///
/// ```rust,ignore
/// let book = Shape::new("book")
///     .field("title", FieldIndex::Any)
///     .field("isbn", FieldIndex::Unique)
///     .field("year", FieldIndex::None);
/// let record = book.instantiate([("title", "A".into())]);
/// ```
#[derive(Debug, Clone)]
pub struct Shape {
    name: String,
    fields: Vec<FieldSpec>,
}

impl Shape {
    /// Creates a shape with no fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Declares a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, index: FieldIndex) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            index,
        });
        self
    }

    /// Returns the shape name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Creates a record instance of this shape.
    ///
    /// The record gets a fresh primary key, and the shape's indexed fields
    /// are classified into the record's unique/any metadata sets.
    #[must_use]
    pub fn instantiate<I, K>(&self, fields: I) -> Record
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut record = Record::new();
        for spec in &self.fields {
            match spec.index {
                FieldIndex::Unique => {
                    record.meta.unique_indexes.insert(spec.name.clone());
                }
                FieldIndex::Any => {
                    record.meta.any_indexes.insert(spec.name.clone());
                }
                FieldIndex::None => {}
            }
        }
        for (name, value) in fields {
            record.fields.insert(name.into(), value);
        }
        record
    }
}
