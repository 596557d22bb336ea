//! The point-lookup core.
//!
//! Given a fully-specified key and a read view, [`point_lookup`]
//! returns the single visible statement (or its absence), reconciling
//! four storage tiers in a fixed order:
//!
//! 1. the transaction's write set (a transaction reads its own
//!    writes, unclipped by the read view);
//! 2. the point cache (a hit is always a fully-folded terminal);
//! 3. the active and sealed mems, newest first;
//! 4. the slices of the covering range, newest first.
//!
//! Each tier appends statements for the key — newest first — to a
//! **history**. The scan short-circuits at the first *terminal*
//! statement (REPLACE, INSERT, or DELETE); everything in front of it
//! is necessarily an UPSERT delta. The folder then walks the history
//! backwards, seeding from the terminal and absorbing deltas, and the
//! result is published to the cache when — and only when — the read
//! view is still *latest* at publication time.
//!
//! ## Liveness against concurrent dumps
//!
//! Reading a run touches disk, and while a lookup is off the mem
//! chain a writer may rotate the active mem or dump a sealed one. The
//! lookup therefore snapshots the index's mem-list version together
//! with the mem chain, and compares it after the disk scan: a
//! mismatch means the collected history may be inconsistent with the
//! new chain, so the history is dropped and the scan rereads from the
//! top. Restarts are unbounded in principle and bounded in practice
//! by dump frequency.
//!
//! ## Slice pinning
//!
//! Every slice of the covering range is pinned before any of them is
//! read, and each is unpinned as soon as its iterator is done — on
//! success, early termination, and error paths alike. The pin set
//! guarantees the on-disk span of the key's history cannot be retired
//! mid-read.

#[cfg(test)]
mod tests;

use std::sync::atomic::Ordering;
use std::time::Instant;

use crossbeam::utils::Backoff;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheError, CachedValue};
use crate::index::{IndexError, LsmIndex, MemSnapshot};
use crate::mem::{Mem, MemError};
use crate::run::{RunError, RunIterator, Slice};
use crate::stmt::{CmpDef, Field, FormatError, Statement, StatementRef, StmtKind, Tuple};
use crate::tx::{ReadView, Tx, TxError};
use crate::upsert::{UpsertError, apply_upsert};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors a point lookup can propagate.
///
/// The first error of any kind aborts further tier scans and skips
/// the fold; cleanup (slice unpins, history drop) always runs, and a
/// partial result is never returned.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The key has fewer fields than the index's comparator requires.
    #[error("lookup key has {actual} fields, index requires {required}")]
    KeyTooShort {
        /// Comparator part count.
        required: usize,
        /// Fields actually supplied.
        actual: usize,
    },

    /// The transaction tracker rejected the point-read registration.
    #[error("transaction tracker error: {0}")]
    Tx(#[from] TxError),

    /// The point cache failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// A mem scan failed.
    #[error("mem error: {0}")]
    Mem(#[from] MemError),

    /// A run iterator failed (I/O, decode, checksum).
    #[error("run iterator error: {0}")]
    Run(#[from] RunError),

    /// Folding the history failed.
    #[error("upsert fold failed: {0}")]
    Upsert(#[from] UpsertError),

    /// Detaching a mem statement failed format validation.
    #[error("statement copy failed: {0}")]
    Format(#[from] FormatError),

    /// The index could not serve a snapshot or range.
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

// ------------------------------------------------------------------------------------------------
// History
// ------------------------------------------------------------------------------------------------

/// Which tier a history statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceType {
    Txw,
    Cache,
    Mem,
    Run,
}

/// One node of a key's history.
#[derive(Debug)]
pub(crate) struct HistoryNode {
    src: SourceType,
    stmt: StatementRef,
}

/// A key's history: statements appended in tier order, newest tier
/// first and newest version first within each tier.
///
/// At most one terminal statement ever enters a history, and only as
/// its last node — every scanner stops appending the moment the
/// history becomes terminal.
#[derive(Debug, Default)]
pub(crate) struct History {
    nodes: Vec<HistoryNode>,
}

impl History {
    fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    fn push(&mut self, src: SourceType, stmt: StatementRef) {
        debug_assert!(
            !self.is_terminal(),
            "appending past a terminal statement"
        );
        self.nodes.push(HistoryNode { src, stmt });
    }

    /// Whether the last node settles the key without an older base.
    pub(crate) fn is_terminal(&self) -> bool {
        self.nodes.last().is_some_and(|node| node.stmt.is_terminal())
    }

    fn clear(&mut self) {
        self.nodes.clear();
    }

    #[cfg(test)]
    pub(crate) fn nodes(&self) -> &[HistoryNode] {
        &self.nodes
    }
}

#[cfg(test)]
impl HistoryNode {
    pub(crate) fn src(&self) -> SourceType {
        self.src
    }

    pub(crate) fn stmt(&self) -> &StatementRef {
        &self.stmt
    }
}

// ------------------------------------------------------------------------------------------------
// Tier scanners
// ------------------------------------------------------------------------------------------------

/// Compare a statement's key parts against the lookup key.
fn key_matches(stmt: &Statement, key_parts: &[Field], cmp_def: &CmpDef) -> bool {
    (0..cmp_def.part_count).all(|idx| {
        stmt.tuple().field(idx) == key_parts.get(idx).map(Vec::as_slice)
    })
}

/// Scan the transaction write set: zero or one statement.
fn scan_txw(
    index: &LsmIndex,
    tx: Option<&Tx>,
    key_parts: &[Field],
    history: &mut History,
) -> Result<(), LookupError> {
    let Some(tx) = tx else {
        return Ok(());
    };
    index.stat().txw.lookup.fetch_add(1, Ordering::Relaxed);
    let Some(stmt) = tx.write_set_search(index.id(), key_parts) else {
        return Ok(());
    };
    index.stat().txw.get.fetch_add(1, Ordering::Relaxed);
    history.push(SourceType::Txw, stmt);
    Ok(())
}

/// Scan the point cache: zero or one statement, always terminal.
fn scan_cache(
    index: &LsmIndex,
    rv: &ReadView,
    key_parts: &[Field],
    history: &mut History,
) -> Result<(), LookupError> {
    let Some(entry) = index.cache().get(key_parts)? else {
        return Ok(());
    };
    match entry {
        // A negative entry proves the key has no statements at all;
        // the remaining tiers will simply find nothing.
        CachedValue::Absent => Ok(()),
        CachedValue::Statement(stmt) => {
            if stmt.lsn() > rv.vlsn() {
                return Ok(());
            }
            history.push(SourceType::Cache, stmt);
            Ok(())
        }
    }
}

/// Scan one mem: statements of the key, newest first, up to a
/// terminal.
fn scan_mem(
    index: &LsmIndex,
    mem: &Mem,
    vlsn: i64,
    key_parts: &[Field],
    history: &mut History,
) -> Result<(), LookupError> {
    index.stat().memory.lookup.fetch_add(1, Ordering::Relaxed);
    let reader = mem.read()?;
    let mut cursor = reader.lower_bound(key_parts, vlsn);

    match cursor.stmt() {
        None => return Ok(()),
        Some(stmt) if !key_matches(stmt, key_parts, index.cmp_def()) => return Ok(()),
        Some(_) => {}
    }

    loop {
        let Some(stmt) = cursor.stmt().cloned() else {
            break;
        };
        index.stat().memory.get.fetch_add(1, Ordering::Relaxed);
        history.push(SourceType::Mem, stmt.clone());
        if history.is_terminal() {
            break;
        }

        cursor.next();
        let Some(next) = cursor.stmt() else {
            break;
        };
        // The tree is `(key ASC, LSN DESC)`: one key's versions form a
        // contiguous descending-LSN run, so a non-decreasing LSN means
        // we crossed into another key's region.
        if next.lsn() >= stmt.lsn() {
            break;
        }
        if !key_matches(next, key_parts, index.cmp_def()) {
            break;
        }
    }
    Ok(())
}

/// Scan the active mem, then each sealed mem newest-first, stopping at
/// a terminal history.
fn scan_mems(
    index: &LsmIndex,
    snapshot: &MemSnapshot,
    vlsn: i64,
    key_parts: &[Field],
    history: &mut History,
) -> Result<(), LookupError> {
    scan_mem(index, &snapshot.active, vlsn, key_parts, history)?;
    for mem in &snapshot.sealed {
        if history.is_terminal() {
            break;
        }
        scan_mem(index, mem, vlsn, key_parts, history)?;
    }
    Ok(())
}

/// Scan one slice through a run iterator.
fn scan_slice(
    index: &LsmIndex,
    slice: &Slice,
    vlsn: i64,
    key_parts: &[Field],
    history: &mut History,
    terminal_found: &mut bool,
) -> Result<(), LookupError> {
    index.stat().disk.lookup.fetch_add(1, Ordering::Relaxed);
    let mut iter = RunIterator::open(slice, key_parts, vlsn)?;
    let mut next = iter.next_key()?;
    while let Some(stmt) = next {
        index.stat().disk.get.fetch_add(1, Ordering::Relaxed);
        let terminal = stmt.is_terminal();
        history.push(SourceType::Run, stmt);
        if terminal {
            *terminal_found = true;
            break;
        }
        next = iter.next_lsn()?;
    }
    Ok(())
}

/// Find the range covering the key and scan its slices newest-first.
///
/// Every slice is pinned before any is read; each is unpinned right
/// after its scan — including when an earlier slice already found a
/// terminal or failed, in which case the remaining slices are only
/// unpinned.
fn scan_slices(
    index: &LsmIndex,
    vlsn: i64,
    key_parts: &[Field],
    history: &mut History,
) -> Result<(), LookupError> {
    let range = index.find_range(key_parts)?;
    let slices = range.slices();
    for slice in &slices {
        slice.pin();
    }

    let mut result = Ok(());
    let mut terminal_found = false;
    for slice in &slices {
        if result.is_ok() && !terminal_found {
            result = scan_slice(index, slice, vlsn, key_parts, history, &mut terminal_found);
        }
        slice.unpin();
    }
    result
}

// ------------------------------------------------------------------------------------------------
// History folding
// ------------------------------------------------------------------------------------------------

/// Fold a history into the final statement and publish it.
fn apply_history(
    index: &LsmIndex,
    rv: &ReadView,
    key_parts: &[Field],
    history: &History,
) -> Result<Option<StatementRef>, LookupError> {
    let mut curr: Option<StatementRef> = None;
    let mut terminal_delete: Option<StatementRef> = None;

    let mut upsert_end = history.nodes.len();
    if history.is_terminal() {
        upsert_end -= 1;
        let node = &history.nodes[upsert_end];
        match node.stmt.kind() {
            StmtKind::Delete => {
                terminal_delete = Some(node.stmt.clone());
            }
            _ if node.src == SourceType::Mem => {
                // A mem statement lives inside a tree whose memory is
                // reclaimed wholesale on dump; detach the result.
                curr = Some(node.stmt.dup(index.mem_format())?);
            }
            _ => {
                curr = Some(node.stmt.clone());
            }
        }
    }

    for node in history.nodes[..upsert_end].iter().rev() {
        debug_assert_eq!(node.stmt.kind(), StmtKind::Upsert);
        debug_assert!(
            node.src == SourceType::Txw || node.stmt.lsn() <= rv.vlsn(),
            "history holds a statement invisible under the read view"
        );
        let folded = apply_upsert(
            &node.stmt,
            curr.as_deref(),
            index.cmp_def(),
            index.mem_format(),
            index.upsert_format(),
            true,
        )?;
        index.stat().upsert_applied.fetch_add(1, Ordering::Relaxed);
        curr = Some(folded);
    }

    if curr.is_some() {
        index.stat().get.fetch_add(1, Ordering::Relaxed);
    }

    // Publication: latest view only, re-read at this instant — a
    // conflicting commit during the scan fixes a tracking reader's
    // view and thereby vetoes the publish. A history with a write-set
    // node folded uncommitted data and is never published.
    let has_txw = history
        .nodes
        .iter()
        .any(|node| node.src == SourceType::Txw);
    if rv.is_latest() && !has_txw {
        let value = match (&curr, &terminal_delete) {
            (Some(stmt), _) => CachedValue::Statement(stmt.clone()),
            (None, Some(delete)) => CachedValue::Statement(delete.clone()),
            (None, None) => CachedValue::Absent,
        };
        index.cache().add(key_parts.to_vec(), value)?;
    }
    Ok(curr)
}

// ------------------------------------------------------------------------------------------------
// Orchestrator
// ------------------------------------------------------------------------------------------------

/// Point lookup: the single statement of `key` visible under `rv`.
///
/// `tx`, when present, contributes its write set as the newest tier
/// and has a point-read intent registered so that conflicting commits
/// racing this lookup push it into a read view instead of letting it
/// publish a stale cache entry.
pub fn point_lookup(
    index: &LsmIndex,
    tx: Option<&Tx>,
    rv: &ReadView,
    key: &Tuple,
) -> Result<Option<StatementRef>, LookupError> {
    if key.field_count() < index.cmp_def().part_count {
        return Err(LookupError::KeyTooShort {
            required: index.cmp_def().part_count,
            actual: key.field_count(),
        });
    }
    let key_parts = index.cmp_def().key_parts(key);
    let start = Instant::now();
    index.stat().lookup.fetch_add(1, Ordering::Relaxed);

    if let Some(tx) = tx {
        tx.track_point(index.id(), &key_parts)?;
    }

    let mut history = History::new();
    loop {
        history.clear();
        let vlsn = rv.vlsn();

        scan_txw(index, tx, &key_parts, &mut history)?;
        if history.is_terminal() {
            break;
        }

        scan_cache(index, rv, &key_parts, &mut history)?;
        if history.is_terminal() {
            break;
        }

        let snapshot = index.mem_snapshot()?;
        scan_mems(index, &snapshot, vlsn, &key_parts, &mut history)?;
        if history.is_terminal() {
            break;
        }

        scan_slices(index, vlsn, &key_parts, &mut history)?;

        if index.errinj().point_iter_wait() {
            // Park until a writer moves the mem list, then disarm so
            // the restarted pass runs normally.
            let backoff = Backoff::new();
            while index.mem_list_version() == snapshot.version {
                backoff.snooze();
            }
            index.errinj().set_point_iter_wait(false);
        }

        if index.mem_list_version() != snapshot.version {
            // The chain rotated or dumped while we were on disk. The
            // in-memory part of the history may describe mems that no
            // longer exist; reread everything.
            index.stat().restart.fetch_add(1, Ordering::Relaxed);
            debug!(index = index.id(), "mem list changed during disk scan, restarting");
            continue;
        }
        break;
    }

    let ret = apply_history(index, rv, &key_parts, &history)?;

    let latency = start.elapsed();
    index.stat().record_latency(latency);
    if latency > index.too_long_threshold() {
        warn!(
            index = index.id(),
            key = ?key_parts,
            ?latency,
            "point lookup took too long"
        );
    }
    Ok(ret)
}
