//! # Cupboard Store
//!
//! Transactional key-value storage engine for Cupboard.
//!
//! This crate provides the storage primitives the persistence layer is
//! built on:
//! - Environments rooted in a directory, with an exclusive lock
//! - Named primary databases (optionally permitting duplicate keys)
//! - Secondary databases maintained from a primary via key-creator functions
//! - Transactions with buffered writes, per-key locking, and an observable
//!   status
//! - Cursors, range scans, and equijoin cursors
//!
//! ## Design Principles
//!
//! - Databases are opaque byte stores; key and value interpretation belongs
//!   to the caller
//! - All handles track open/closed state and are closed exactly once
//! - Lock conflicts surface immediately as [`StoreError::Deadlock`] so that
//!   callers can drive a bounded retry loop
//!
//! ## Example
//!
//! ```rust,ignore
//! use cupboard_store::{DatabaseConfig, Environment, EnvironmentConfig};
//!
//! let env = Environment::open(dir, EnvironmentConfig::default())?;
//! let db = env.open_database("books", DatabaseConfig::default())?;
//! db.put(b"k", b"v", None)?;
//! assert_eq!(db.get(b"k", None)?, Some(b"v".to_vec()));
//! db.close()?;
//! env.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod database;
mod env;
mod error;
mod registry;
mod secondary;
mod transaction;
mod types;

pub use cursor::{Cursor, JoinCursor, ScanComparison, ScanCursor};
pub use database::{Database, DatabaseConfig};
pub use env::{Environment, EnvironmentConfig};
pub use error::{StoreError, StoreResult};
pub use secondary::{KeyCreator, SecondaryConfig, SecondaryDatabase};
pub use transaction::{Transaction, TransactionConfig};
pub use types::{Isolation, LockMode, TransactionId, TransactionStatus, WriteOutcome};
