//! In-memory write buffers (mems).
//!
//! A mem holds recently committed statements for one index, ordered by
//! `(key parts ASC, LSN DESC)`. One mem is **active** (still accepting
//! inserts); older mems are **sealed** and wait to be dumped to an
//! on-disk run, after which they are dropped wholesale.
//!
//! ## Design Invariants
//!
//! - A mem may contain multiple versions per key; all versions of one
//!   key form a contiguous run in descending-LSN order.
//! - Statements are immutable and shared ([`StatementRef`]); the mem
//!   only orders them.
//! - `lower_bound(key, vlsn)` positions on the newest statement of
//!   `key` with `lsn ≤ vlsn`, the entry point for visibility-clipped
//!   point reads.
//!
//! ## Concurrency
//!
//! The tree is behind an `RwLock`. Readers take the lock for the
//! duration of one mem scan — the scan never blocks on I/O, so the
//! critical section is short. Writers insert under the write lock.

#[cfg(test)]
mod tests;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard};

use thiserror::Error;
use tracing::trace;

use crate::stmt::{CmpDef, Field, StatementRef};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Mem`] operations.
#[derive(Debug, Error)]
pub enum MemError {
    /// The statement's tuple has fewer fields than the comparator's
    /// part count.
    #[error("statement key has {actual} parts, comparator requires {required}")]
    KeyTooShort {
        /// Comparator part count.
        required: usize,
        /// Fields actually present.
        actual: usize,
    },

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Ordering key
// ------------------------------------------------------------------------------------------------

/// Tree key: key parts ascending, then LSN descending.
///
/// `Reverse` puts the newest version of a key first, so all versions
/// of one key form a contiguous descending-LSN run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MemKey {
    parts: Vec<Field>,
    lsn: Reverse<i64>,
}

struct MemInner {
    tree: BTreeMap<MemKey, StatementRef>,
    min_lsn: i64,
    max_lsn: i64,
}

// ------------------------------------------------------------------------------------------------
// Mem
// ------------------------------------------------------------------------------------------------

/// An in-memory buffer of committed statements for one index.
pub struct Mem {
    id: u64,
    cmp_def: CmpDef,
    inner: RwLock<MemInner>,
}

impl Mem {
    /// Creates an empty mem.
    pub fn new(id: u64, cmp_def: CmpDef) -> Self {
        Self {
            id,
            cmp_def,
            inner: RwLock::new(MemInner {
                tree: BTreeMap::new(),
                min_lsn: i64::MAX,
                max_lsn: 0,
            }),
        }
    }

    /// This mem's identifier (monotonic per index).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The comparator this mem orders by.
    pub fn cmp_def(&self) -> &CmpDef {
        &self.cmp_def
    }

    /// Insert a committed statement.
    pub fn insert(&self, stmt: StatementRef) -> Result<(), MemError> {
        if stmt.tuple().field_count() < self.cmp_def.part_count {
            return Err(MemError::KeyTooShort {
                required: self.cmp_def.part_count,
                actual: stmt.tuple().field_count(),
            });
        }
        let mut inner = self
            .inner
            .write()
            .map_err(|_| MemError::Internal("mem lock poisoned".into()))?;
        let key = MemKey {
            parts: stmt.key_parts(&self.cmp_def),
            lsn: Reverse(stmt.lsn()),
        };
        trace!(mem_id = self.id, lsn = stmt.lsn(), "mem insert");
        inner.min_lsn = inner.min_lsn.min(stmt.lsn());
        inner.max_lsn = inner.max_lsn.max(stmt.lsn());
        inner.tree.insert(key, stmt);
        Ok(())
    }

    /// Number of statements held.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.tree.len()).unwrap_or(0)
    }

    /// Whether the mem holds no statements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest LSN held, or `None` when empty.
    pub fn min_lsn(&self) -> Option<i64> {
        let inner = self.inner.read().ok()?;
        (!inner.tree.is_empty()).then_some(inner.min_lsn)
    }

    /// Largest LSN held, or `None` when empty.
    pub fn max_lsn(&self) -> Option<i64> {
        let inner = self.inner.read().ok()?;
        (!inner.tree.is_empty()).then_some(inner.max_lsn)
    }

    /// Acquire a read view over the tree.
    pub fn read(&self) -> Result<MemReader<'_>, MemError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| MemError::Internal("mem lock poisoned".into()))?;
        Ok(MemReader { guard })
    }

    /// Snapshot all statements in `(key ASC, LSN DESC)` order.
    ///
    /// Used by the dump path to stream a sealed mem into a run writer.
    pub fn stmts_in_order(&self) -> Result<Vec<StatementRef>, MemError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| MemError::Internal("mem lock poisoned".into()))?;
        Ok(inner.tree.values().cloned().collect())
    }
}

// ------------------------------------------------------------------------------------------------
// Readers and cursors
// ------------------------------------------------------------------------------------------------

/// A read lock over one mem's tree.
pub struct MemReader<'a> {
    guard: RwLockReadGuard<'a, MemInner>,
}

impl MemReader<'_> {
    /// Position a cursor on the newest statement with key `key_parts`
    /// and `lsn ≤ vlsn`, or — if the key holds no such version — on
    /// whatever entry follows in tree order. The caller is expected to
    /// verify the key under its comparator.
    pub fn lower_bound(&self, key_parts: &[Field], vlsn: i64) -> MemCursor<'_> {
        let start = MemKey {
            parts: key_parts.to_vec(),
            lsn: Reverse(vlsn),
        };
        let mut range = self
            .guard
            .tree
            .range((Bound::Included(start), Bound::Unbounded));
        let current = range.next();
        MemCursor { range, current }
    }
}

/// A forward cursor over a mem tree in `(key ASC, LSN DESC)` order.
pub struct MemCursor<'g> {
    range: btree_map::Range<'g, MemKey, StatementRef>,
    current: Option<(&'g MemKey, &'g StatementRef)>,
}

impl<'g> MemCursor<'g> {
    /// Whether the cursor points at an entry.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The statement under the cursor.
    pub fn stmt(&self) -> Option<&'g StatementRef> {
        self.current.map(|(_, stmt)| stmt)
    }

    /// Advance one entry in tree order.
    pub fn next(&mut self) {
        self.current = self.range.next();
    }
}
