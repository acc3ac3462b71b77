//! # Cupboard Core
//!
//! Embedded transactional object persistence atop the `cupboard_store`
//! key-value engine.
//!
//! This crate provides:
//! - The [`Cupboard`]: a persistence environment rooted in a directory
//! - [`Shelf`]s: named record collections with unique and any indices
//! - A persistent catalog of shelves and index options
//! - Records with stable primary keys and declarative [`Shape`]s
//! - Transactions with an observable status and a deadlock-retry block
//! - A query engine that plans natural (equijoin) or range joins over
//!   index cursors, with cursor-owning lazy result streams
//!
//! ## Example
//!
//! ```rust,ignore
//! use cupboard_core::{
//!     Clause, Cupboard, CupboardConfig, FieldIndex, InstanceOptions,
//!     QueryOptions, Shape,
//! };
//!
//! let cb = Cupboard::open(dir, CupboardConfig::default())?;
//! let book = Shape::new("book")
//!     .field("title", FieldIndex::Any)
//!     .field("isbn", FieldIndex::Unique);
//!
//! cb.make_instance(
//!     &book,
//!     [("title", "A".into()), ("isbn", "1".into())],
//!     &InstanceOptions::default(),
//!     None,
//! )?;
//!
//! let hits = cb.query(
//!     &[Clause::eq("title", "A")],
//!     &QueryOptions::default(),
//!     None,
//! )?;
//! cb.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod config;
mod cupboard;
mod error;
mod ops;
mod query;
mod record;
mod shape;
mod shelf;
mod txn;
mod value;

pub use catalog::{
    composite_name, validate_index_name, validate_shelf_name, CATALOG_NAME, NAME_SEPARATOR,
};
pub use config::{
    CupboardConfig, IndexOptions, QueryOptions, RetryOptions, ShelfOptions, TxnOptions,
};
pub use cupboard::{with_cupboard, Cupboard, DEFAULT_SHELF};
pub use error::{CupboardError, CupboardResult};
pub use ops::{InstanceOptions, RetrieveOptions, SaveOptions};
pub use query::{Clause, ClauseSelector, FirstClause, Predicate, RecordStream};
pub use record::{Record, RecordId, RecordMeta};
pub use shape::{FieldIndex, FieldSpec, Shape};
pub use shelf::Shelf;
pub use txn::Txn;
pub use value::Value;

// Storage-level types that appear in this crate's public API.
pub use cupboard_store::{Isolation, LockMode, TransactionId, TransactionStatus};
