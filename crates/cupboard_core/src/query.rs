//! Query engine: clause planning and cursor-join execution.
//!
//! A query is an ordered sequence of clauses, each a predicate over one
//! indexed field. The planner picks between two strategies:
//!
//! - **Natural join**: every clause is an equality. Each clause's index
//!   cursor is positioned exactly at its value and an equijoin cursor
//!   intersects them.
//! - **Range join**: at least one clause is a range (or custom) predicate.
//!   A dominating clause is chosen, its index is scanned with the clause's
//!   comparison, and every candidate is filtered through all clauses.
//!
//! Both strategies produce a [`RecordStream`]: a lazy iterator that owns
//! its cursors and closes them on exhaustion and on drop.

use crate::config::{IndexOptions, QueryOptions, ShelfOptions};
use crate::cupboard::{Cupboard, DEFAULT_SHELF};
use crate::error::{CupboardError, CupboardResult};
use crate::record::Record;
use crate::shelf::Shelf;
use crate::txn::Txn;
use crate::value::Value;
use cupboard_store::{Cursor, JoinCursor, LockMode, ScanComparison, ScanCursor};
use std::sync::Arc;

/// A binary predicate over field values.
#[derive(Clone)]
pub enum Predicate {
    /// Equality.
    Eq,
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// A caller-supplied predicate of `(candidate, reference)`.
    Custom(Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>),
}

impl Predicate {
    /// Whether this predicate is plain equality.
    #[must_use]
    pub fn is_equality(&self) -> bool {
        matches!(self, Predicate::Eq)
    }

    /// Applies the predicate to a candidate field value.
    #[must_use]
    pub fn matches(&self, candidate: &Value, reference: &Value) -> bool {
        match self {
            Predicate::Eq => candidate == reference,
            Predicate::Lt => candidate < reference,
            Predicate::Le => candidate <= reference,
            Predicate::Gt => candidate > reference,
            Predicate::Ge => candidate >= reference,
            Predicate::Custom(f) => f(candidate, reference),
        }
    }

    /// The cursor scan comparison this predicate drives when its clause
    /// dominates a range join. Custom predicates degrade to a full scan.
    fn scan_comparison(&self) -> ScanComparison {
        match self {
            Predicate::Eq => ScanComparison::Eq,
            Predicate::Lt => ScanComparison::Lt,
            Predicate::Le => ScanComparison::Le,
            Predicate::Gt => ScanComparison::Gt,
            Predicate::Ge => ScanComparison::Ge,
            Predicate::Custom(_) => ScanComparison::Ge,
        }
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Predicate::Eq => "=",
            Predicate::Lt => "<",
            Predicate::Le => "<=",
            Predicate::Gt => ">",
            Predicate::Ge => ">=",
            Predicate::Custom(_) => "custom",
        };
        write!(f, "{name}")
    }
}

/// One query clause: a predicate over an indexed field.
#[derive(Debug, Clone)]
pub struct Clause {
    /// The indexed field (index name and field name coincide).
    pub field: String,
    /// The predicate.
    pub op: Predicate,
    /// The reference value.
    pub value: Value,
}

impl Clause {
    /// Creates a clause with an explicit predicate.
    pub fn new(op: Predicate, field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Equality clause.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(Predicate::Eq, field, value)
    }

    /// Less-than clause.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(Predicate::Lt, field, value)
    }

    /// Less-than-or-equal clause.
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(Predicate::Le, field, value)
    }

    /// Greater-than clause.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(Predicate::Gt, field, value)
    }

    /// Greater-than-or-equal clause.
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(Predicate::Ge, field, value)
    }

    /// Clause with a caller-supplied predicate.
    pub fn custom(
        field: impl Into<String>,
        value: impl Into<Value>,
        predicate: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::new(Predicate::Custom(Arc::new(predicate)), field, value)
    }

    fn matches_record(&self, record: &Record) -> bool {
        record
            .fields
            .get(&self.field)
            .map_or(false, |value| self.op.matches(value, &self.value))
    }
}

/// Chooses the dominating clause for a range join.
///
/// The shipped selector takes the first clause; a selectivity-estimating
/// implementation can be substituted without touching the executor.
pub trait ClauseSelector {
    /// Returns the index of the dominating clause.
    fn select(&self, clauses: &[Clause]) -> usize;
}

/// Selects the first clause.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstClause;

impl ClauseSelector for FirstClause {
    fn select(&self, _clauses: &[Clause]) -> usize {
        0
    }
}

enum StreamSource {
    Done,
    Single(Option<Record>),
    Join {
        join: JoinCursor,
        cursors: Vec<Cursor>,
    },
    Scan(ScanCursor),
}

/// A lazy stream of records backed by cursors.
///
/// The stream owns its cursors and closes them when it is exhausted and
/// when it is dropped, so an abandoned stream leaks nothing.
pub struct RecordStream<'a> {
    shelf: Arc<Shelf>,
    txn: Option<&'a Txn>,
    lock_mode: LockMode,
    clauses: Vec<Clause>,
    source: StreamSource,
}

impl<'a> RecordStream<'a> {
    fn empty(shelf: Arc<Shelf>) -> Self {
        Self {
            shelf,
            txn: None,
            lock_mode: LockMode::default(),
            clauses: Vec::new(),
            source: StreamSource::Done,
        }
    }

    pub(crate) fn single(shelf: Arc<Shelf>, record: Option<Record>) -> Self {
        Self {
            shelf,
            txn: None,
            lock_mode: LockMode::default(),
            clauses: Vec::new(),
            source: StreamSource::Single(record),
        }
    }
}

fn close_join(mut join: JoinCursor, cursors: Vec<Cursor>) {
    let _ = join.close();
    for mut cursor in cursors {
        let _ = cursor.close();
    }
}

impl Iterator for RecordStream<'_> {
    type Item = CupboardResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let source = std::mem::replace(&mut self.source, StreamSource::Done);
            match source {
                StreamSource::Done => return None,
                StreamSource::Single(record) => return record.map(Ok),
                StreamSource::Join { mut join, cursors } => {
                    match join.next_entry(self.lock_mode) {
                        Ok(Some((_pkey, bytes))) => {
                            self.source = StreamSource::Join { join, cursors };
                            return Some(Record::decode(&bytes));
                        }
                        Ok(None) => {
                            close_join(join, cursors);
                            return None;
                        }
                        Err(err) => {
                            close_join(join, cursors);
                            return Some(Err(err.into()));
                        }
                    }
                }
                StreamSource::Scan(mut scan) => {
                    let (_sec_key, pkey) = match scan.next() {
                        Some(entry) => entry,
                        // Dropping the exhausted scan closes its cursor.
                        None => return None,
                    };
                    let store_txn = self.txn.map(|t| &t.inner);
                    match self.shelf.primary().get(&pkey, store_txn) {
                        Err(err) => return Some(Err(err.into())),
                        // Stale index entry; skip.
                        Ok(None) => {
                            self.source = StreamSource::Scan(scan);
                            continue;
                        }
                        Ok(Some(bytes)) => {
                            let record = match Record::decode(&bytes) {
                                Ok(record) => record,
                                Err(err) => return Some(Err(err)),
                            };
                            self.source = StreamSource::Scan(scan);
                            if self
                                .clauses
                                .iter()
                                .all(|clause| clause.matches_record(&record))
                            {
                                return Some(Ok(record));
                            }
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RecordStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strategy = match &self.source {
            StreamSource::Done => "done",
            StreamSource::Single(_) => "single",
            StreamSource::Join { .. } => "natural-join",
            StreamSource::Scan(_) => "range-join",
        };
        f.debug_struct("RecordStream")
            .field("shelf", &self.shelf.name())
            .field("strategy", &strategy)
            .finish_non_exhaustive()
    }
}

impl Cupboard {
    /// Runs a query and materializes up to `limit` records.
    ///
    /// The owning cursors are closed before this returns.
    pub fn query(
        &self,
        clauses: &[Clause],
        options: &QueryOptions,
        txn: Option<&Txn>,
    ) -> CupboardResult<Vec<Record>> {
        self.query_map(clauses, options, txn, |record| record)
    }

    /// Runs a query, applying `callback` to each record during
    /// materialization.
    pub fn query_map<T, F>(
        &self,
        clauses: &[Clause],
        options: &QueryOptions,
        txn: Option<&Txn>,
        mut callback: F,
    ) -> CupboardResult<Vec<T>>
    where
        F: FnMut(Record) -> T,
    {
        let mut stream = self.query_stream(clauses, options, txn)?;
        let mut results = Vec::new();
        for item in &mut stream {
            results.push(callback(item?));
            if options.limit.map_or(false, |limit| results.len() >= limit) {
                break;
            }
        }
        // Dropping the stream closes the owning cursors.
        drop(stream);
        Ok(results)
    }

    /// Runs a query lazily, returning the record stream itself.
    pub fn query_stream<'a>(
        &self,
        clauses: &[Clause],
        options: &QueryOptions,
        txn: Option<&'a Txn>,
    ) -> CupboardResult<RecordStream<'a>> {
        self.query_stream_with(clauses, options, txn, &FirstClause)
    }

    /// Runs a query lazily with an explicit dominating-clause selector.
    pub fn query_stream_with<'a>(
        &self,
        clauses: &[Clause],
        options: &QueryOptions,
        txn: Option<&'a Txn>,
        selector: &dyn ClauseSelector,
    ) -> CupboardResult<RecordStream<'a>> {
        self.ensure_open()?;
        if clauses.is_empty() {
            return Err(CupboardError::invalid_argument(
                "query requires at least one clause",
            ));
        }

        let shelf_name = options.shelf.as_deref().unwrap_or(DEFAULT_SHELF);
        let shelf = self.get_shelf(shelf_name, &ShelfOptions::default())?;

        if clauses.iter().all(|clause| clause.op.is_equality()) {
            self.natural_join(shelf, clauses, options, txn)
        } else {
            self.range_join(shelf, clauses, options, txn, selector)
        }
    }

    /// Equijoin executor: position one cursor per clause, intersect.
    fn natural_join<'a>(
        &self,
        shelf: Arc<Shelf>,
        clauses: &[Clause],
        options: &QueryOptions,
        txn: Option<&'a Txn>,
    ) -> CupboardResult<RecordStream<'a>> {
        let mut cursors: Vec<Cursor> = Vec::with_capacity(clauses.len());
        for clause in clauses {
            let mut cursor = self.open_index_cursor(&shelf, &clause.field, txn)?;
            let hit = cursor.search(&clause.value.encode_key(), true, options.lock_mode)?;
            if hit.is_none() {
                // One empty clause empties the whole intersection.
                let _ = cursor.close();
                for mut open in cursors {
                    let _ = open.close();
                }
                return Ok(RecordStream::empty(shelf));
            }
            cursors.push(cursor);
        }

        let store_txn = txn.map(|t| &t.inner);
        let join = shelf.primary().join(&cursors, store_txn)?;
        Ok(RecordStream {
            shelf,
            txn,
            lock_mode: options.lock_mode,
            clauses: Vec::new(),
            source: StreamSource::Join { join, cursors },
        })
    }

    /// Range executor: scan the dominating clause's index, filter by all
    /// clauses.
    fn range_join<'a>(
        &self,
        shelf: Arc<Shelf>,
        clauses: &[Clause],
        options: &QueryOptions,
        txn: Option<&'a Txn>,
        selector: &dyn ClauseSelector,
    ) -> CupboardResult<RecordStream<'a>> {
        let index = selector.select(clauses).min(clauses.len() - 1);
        let dominating = &clauses[index];

        let cursor = self.open_index_cursor(&shelf, &dominating.field, txn)?;
        let comparison = dominating.op.scan_comparison();
        let start = match dominating.op {
            // A custom dominating predicate cannot bound the scan.
            Predicate::Custom(_) => Vec::new(),
            _ => dominating.value.encode_key(),
        };
        let scan = cursor.scan(&start, comparison);

        Ok(RecordStream {
            shelf,
            txn,
            lock_mode: options.lock_mode,
            clauses: clauses.to_vec(),
            source: StreamSource::Scan(scan),
        })
    }

    /// Opens a cursor on the index backing `field`, whichever registry it
    /// lives in. A clause may reference a field with no index yet; the
    /// index is established on demand with default options and populated
    /// from the shelf's existing records.
    fn open_index_cursor(
        &self,
        shelf: &Arc<Shelf>,
        field: &str,
        txn: Option<&Txn>,
    ) -> CupboardResult<Cursor> {
        if shelf.index_kind(field).is_none() {
            shelf.open_index(self.env(), self.catalog(), field, &IndexOptions::default())?;
        }

        let store_txn = txn.map(|t| &t.inner);
        if let Some(secondary) = shelf.unique_indexes.read().get(field) {
            return Ok(secondary.open_cursor(store_txn)?);
        }
        if let Some(secondary) = shelf.any_indexes.read().get(field) {
            return Ok(secondary.open_cursor(store_txn)?);
        }
        Err(CupboardError::UnindexedField {
            shelf: shelf.name().to_string(),
            field: field.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_matches() {
        let two = Value::Int(2);
        let three = Value::Int(3);

        assert!(Predicate::Eq.matches(&two, &two));
        assert!(Predicate::Lt.matches(&two, &three));
        assert!(Predicate::Le.matches(&two, &two));
        assert!(Predicate::Gt.matches(&three, &two));
        assert!(Predicate::Ge.matches(&three, &three));
        assert!(!Predicate::Gt.matches(&two, &three));

        let odd = Predicate::Custom(Arc::new(|candidate, _| {
            matches!(candidate, Value::Int(i) if i % 2 == 1)
        }));
        assert!(odd.matches(&three, &two));
        assert!(!odd.matches(&two, &two));
    }

    #[test]
    fn clause_matches_record() {
        let mut record = Record::new();
        record.assoc("year", 2002i64);

        assert!(Clause::ge("year", 2001i64).matches_record(&record));
        assert!(!Clause::lt("year", 2000i64).matches_record(&record));
        // A missing field never matches.
        assert!(!Clause::eq("title", "A").matches_record(&record));
    }

    #[test]
    fn first_clause_selector() {
        let clauses = vec![Clause::ge("year", 2001i64), Clause::eq("title", "A")];
        assert_eq!(FirstClause.select(&clauses), 0);
    }
}
