//! Cursors, range scans, and equijoin cursors.
//!
//! A cursor materializes a sorted snapshot of a database (committed state
//! plus the opening transaction's pending overlay) at open time. Duplicate
//! keys appear as consecutive entries. Cursors are closed exactly once,
//! either explicitly or on drop.
//!
//! Lock modes are recorded per read call; with the engine's
//! private-overlay write buffering there is no uncommitted data from other
//! transactions to observe, so `ReadUncommitted` and `ReadCommitted`
//! behave alike, and `Rmw` callers acquire write locks at write time.

use crate::database::{Database, DbShared};
use crate::env::Environment;
use crate::error::{StoreError, StoreResult};
use crate::secondary::SecondaryDatabase;
use crate::transaction::Transaction;
use crate::types::LockMode;
use std::sync::atomic::Ordering;

/// Comparison applied by [`Cursor::scan`] between entry keys and the
/// scan's start value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanComparison {
    /// Keys strictly less than the start value.
    Lt,
    /// Keys less than or equal to the start value.
    Le,
    /// Keys strictly greater than the start value.
    Gt,
    /// Keys greater than or equal to the start value.
    ///
    /// With an empty start value this scans the whole database.
    Ge,
    /// Keys equal to the start value.
    Eq,
}

/// A cursor over a database snapshot.
pub struct Cursor {
    env: Environment,
    name: String,
    items: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
    closed: bool,
}

fn snapshot(shared: &DbShared, txn: Option<&Transaction>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut map = shared.entries.read().clone();
    if let Some(txn) = txn {
        for key in txn.overlay_keys(shared) {
            let committed = map.get(&key).cloned().unwrap_or_default();
            let effective = txn.overlay_values(shared, &key, committed);
            if effective.is_empty() {
                map.remove(&key);
            } else {
                map.insert(key, effective);
            }
        }
    }

    let mut items = Vec::new();
    for (key, values) in map {
        for value in values {
            items.push((key.clone(), value));
        }
    }
    items
}

fn open_cursor_on(
    env: &Environment,
    shared: &DbShared,
    txn: Option<&Transaction>,
) -> StoreResult<Cursor> {
    env.inner.ensure_open()?;
    if let Some(txn) = txn {
        txn.ensure_status_open()?;
    }
    env.inner.open_cursors.fetch_add(1, Ordering::SeqCst);
    Ok(Cursor {
        env: env.clone(),
        name: shared.name.clone(),
        items: snapshot(shared, txn),
        pos: None,
        closed: false,
    })
}

impl Database {
    /// Opens a cursor over this database.
    pub fn open_cursor(&self, txn: Option<&Transaction>) -> StoreResult<Cursor> {
        self.ensure_handle_open()?;
        open_cursor_on(&self.env, &self.shared, txn)
    }

    /// Opens an equijoin cursor over positioned secondary cursors.
    ///
    /// Each cursor must be positioned (via [`Cursor::search`]); the join
    /// yields the primary records whose key appears at every cursor's
    /// current position.
    pub fn join(
        &self,
        cursors: &[Cursor],
        txn: Option<&Transaction>,
    ) -> StoreResult<JoinCursor> {
        self.ensure_handle_open()?;
        self.env.inner.ensure_open()?;

        let mut candidate_lists = Vec::with_capacity(cursors.len());
        for cursor in cursors {
            cursor.ensure_cursor_open()?;
            if cursor.pos.is_none() {
                return Err(StoreError::invalid_operation(
                    "join cursor requires positioned cursors",
                ));
            }
            candidate_lists.push(cursor.current_values());
        }

        let mut items = Vec::new();
        if let Some((first, rest)) = candidate_lists.split_first() {
            for pkey in first {
                if rest.iter().all(|list| list.contains(pkey)) {
                    if let Some(value) =
                        crate::database::effective_values(&self.shared, pkey, txn)
                            .into_iter()
                            .next()
                    {
                        items.push((pkey.clone(), value));
                    }
                }
            }
        }

        self.env.inner.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(JoinCursor {
            env: self.env.clone(),
            items,
            pos: 0,
            closed: false,
        })
    }
}

impl SecondaryDatabase {
    /// Opens a cursor over this secondary database.
    ///
    /// Entries are `(secondary key, primary key)` pairs.
    pub fn open_cursor(&self, txn: Option<&Transaction>) -> StoreResult<Cursor> {
        self.ensure_handle_open()?;
        // Secondary contents are maintained at commit, so the overlay is
        // not consulted here.
        let _ = txn;
        open_cursor_on(&self.env, &self.data, None)
    }
}

impl Cursor {
    fn ensure_cursor_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::HandleClosed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Positions the cursor at `key`.
    ///
    /// With `exact`, the cursor lands on the first entry whose key equals
    /// `key`; otherwise on the first entry with key `>= key`. Returns the
    /// entry, or `None` (cursor left unpositioned) if there is no match.
    pub fn search(
        &mut self,
        key: &[u8],
        exact: bool,
        _lock_mode: LockMode,
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.ensure_cursor_open()?;

        let idx = self.items.partition_point(|(k, _)| k.as_slice() < key);
        if idx >= self.items.len() {
            self.pos = None;
            return Ok(None);
        }
        if exact && self.items[idx].0 != key {
            self.pos = None;
            return Ok(None);
        }
        self.pos = Some(idx);
        Ok(Some(self.items[idx].clone()))
    }

    /// Advances to the next entry. An unpositioned cursor moves to the
    /// first entry.
    pub fn next_entry(&mut self) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.ensure_cursor_open()?;

        let next = match self.pos {
            None => 0,
            Some(pos) => pos + 1,
        };
        if next >= self.items.len() {
            self.pos = Some(self.items.len());
            return Ok(None);
        }
        self.pos = Some(next);
        Ok(Some(self.items[next].clone()))
    }

    /// Returns the entry at the current position.
    #[must_use]
    pub fn current(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.pos
            .and_then(|pos| self.items.get(pos))
            .cloned()
    }

    /// Returns every value stored under the current position's key.
    #[must_use]
    pub fn current_values(&self) -> Vec<Vec<u8>> {
        let pos = match self.pos {
            Some(pos) if pos < self.items.len() => pos,
            _ => return Vec::new(),
        };
        let key = &self.items[pos].0;

        let mut start = pos;
        while start > 0 && self.items[start - 1].0 == *key {
            start -= 1;
        }
        self.items[start..]
            .iter()
            .take_while(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Consumes the cursor into a range scan.
    ///
    /// Entries are yielded in key order; only those whose key satisfies
    /// `comparison` against `start` are produced. The cursor is closed
    /// when the scan is dropped.
    #[must_use]
    pub fn scan(mut self, start: &[u8], comparison: ScanComparison) -> ScanCursor {
        let idx = match comparison {
            ScanComparison::Ge | ScanComparison::Eq => self
                .items
                .partition_point(|(k, _)| k.as_slice() < start),
            ScanComparison::Gt => self
                .items
                .partition_point(|(k, _)| k.as_slice() <= start),
            ScanComparison::Lt | ScanComparison::Le => 0,
        };
        self.pos = None;
        ScanCursor {
            start: start.to_vec(),
            comparison,
            idx,
            cursor: self,
        }
    }

    /// Closes the cursor.
    pub fn close(&mut self) -> StoreResult<()> {
        self.ensure_cursor_open()?;
        self.closed = true;
        self.env.inner.open_cursors.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("database", &self.name)
            .field("entries", &self.items.len())
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.env.inner.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// An owning range scan over a cursor's snapshot.
///
/// Dropping the scan closes the underlying cursor.
pub struct ScanCursor {
    cursor: Cursor,
    start: Vec<u8>,
    comparison: ScanComparison,
    idx: usize,
}

impl Iterator for ScanCursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.cursor.items.get(self.idx)?;
        let keep = match self.comparison {
            ScanComparison::Lt => item.0.as_slice() < self.start.as_slice(),
            ScanComparison::Le => item.0.as_slice() <= self.start.as_slice(),
            ScanComparison::Eq => item.0 == self.start,
            // Start index already bounds these from below.
            ScanComparison::Gt | ScanComparison::Ge => true,
        };
        if !keep {
            return None;
        }
        self.idx += 1;
        Some(item.clone())
    }
}

impl std::fmt::Debug for ScanCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCursor")
            .field("comparison", &self.comparison)
            .field("idx", &self.idx)
            .finish_non_exhaustive()
    }
}

/// An equijoin cursor over the intersection of positioned cursors.
pub struct JoinCursor {
    env: Environment,
    items: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
    closed: bool,
}

impl JoinCursor {
    /// Yields the next `(primary key, primary value)` pair.
    pub fn next_entry(
        &mut self,
        _lock_mode: LockMode,
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        if self.closed {
            return Err(StoreError::HandleClosed {
                name: "join cursor".to_string(),
            });
        }
        if self.pos >= self.items.len() {
            return Ok(None);
        }
        let item = self.items[self.pos].clone();
        self.pos += 1;
        Ok(Some(item))
    }

    /// Closes the join cursor.
    pub fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::HandleClosed {
                name: "join cursor".to_string(),
            });
        }
        self.closed = true;
        self.env.inner.open_cursors.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for JoinCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinCursor")
            .field("entries", &self.items.len())
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl Drop for JoinCursor {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.env.inner.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
