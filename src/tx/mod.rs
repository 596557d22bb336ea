//! Transactions: write sets, point-read tracking, and read views.
//!
//! ## Read views
//!
//! A [`ReadView`] decides which LSNs a reader may see: a statement is
//! visible iff `lsn ≤ vlsn`. The special vlsn `i64::MAX` means
//! *latest* — the reader sees every committed statement, and only
//! results obtained at this view may be published to the point cache.
//!
//! The view's vlsn is a shared atomic rather than a plain integer
//! because it can change **mid-lookup**: when another transaction
//! commits a key that this transaction registered interest in (via
//! [`Tx::track_point`]), the committer fixes this transaction's view
//! at the pre-commit vlsn. A lookup that was suspended on disk I/O at
//! that moment re-reads the view at cache-publication time and, seeing
//! a non-latest vlsn, refrains from publishing a value that is already
//! stale.
//!
//! ## Write sets
//!
//! A transaction stages at most one statement per `(index, key)`.
//! Staging an upsert folds it into an earlier staged statement when
//! one exists, so the write set usually holds terminal statements —
//! but a first-write upsert stays raw (there is nothing to fold it
//! against until the lookup walks the older tiers).
//!
//! Commit assigns LSNs from the manager's counter, moves statements
//! into the index's active mem, and invalidates cache entries for the
//! written keys.


use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::CacheError;
use crate::index::{IndexError, LsmIndex};
use crate::stmt::{Field, Statement, StatementRef, StmtKind, Tuple, UpsertOp};
use crate::upsert::{UpsertError, apply_upsert};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by transaction operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// The transaction is no longer active.
    #[error("transaction {0} is not active")]
    NotActive(u64),

    /// The write set holds statements for an index other than the one
    /// being committed.
    #[error("write set targets index {staged}, committing into index {committing}")]
    ForeignIndex {
        /// Index id found in the write set.
        staged: u64,
        /// Index id passed to commit.
        committing: u64,
    },

    /// Folding a staged upsert failed.
    #[error("upsert fold failed: {0}")]
    Upsert(#[from] UpsertError),

    /// Applying the write set to the index failed.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Cache invalidation failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Read views
// ------------------------------------------------------------------------------------------------

/// A snapshot descriptor: defines which LSNs are visible.
#[derive(Debug, Clone)]
pub struct ReadView {
    vlsn: Arc<AtomicI64>,
}

impl ReadView {
    /// The latest view — sees every committed statement.
    pub fn latest() -> Self {
        Self {
            vlsn: Arc::new(AtomicI64::new(i64::MAX)),
        }
    }

    /// A view fixed at `vlsn`.
    pub fn fixed(vlsn: i64) -> Self {
        Self {
            vlsn: Arc::new(AtomicI64::new(vlsn)),
        }
    }

    /// The current visibility horizon.
    pub fn vlsn(&self) -> i64 {
        self.vlsn.load(Ordering::Acquire)
    }

    /// Whether this view currently sees the latest state.
    pub fn is_latest(&self) -> bool {
        self.vlsn() == i64::MAX
    }

    /// Whether a statement at `lsn` is visible under this view.
    pub fn contains(&self, lsn: i64) -> bool {
        lsn <= self.vlsn()
    }

    /// Fix the view at `vlsn`. Only ever moves a latest view backward.
    pub(crate) fn fix(&self, vlsn: i64) {
        self.vlsn.store(vlsn, Ordering::Release);
    }
}

// ------------------------------------------------------------------------------------------------
// Transactions
// ------------------------------------------------------------------------------------------------

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting writes and reads.
    Active,
    /// Successfully committed.
    Committed,
    /// Rolled back.
    Aborted,
}

struct TxInner {
    state: TxState,
    /// `(index id, key parts)` → staged statement, at most one per key.
    write_set: BTreeMap<(u64, Vec<Field>), StatementRef>,
    /// Keys whose point reads this transaction registered.
    tracked: BTreeSet<(u64, Vec<Field>)>,
}

/// A transaction handle.
pub struct Tx {
    id: u64,
    read_view: ReadView,
    inner: RwLock<TxInner>,
}

impl Tx {
    fn new(id: u64) -> Self {
        Self {
            id,
            read_view: ReadView::latest(),
            inner: RwLock::new(TxInner {
                state: TxState::Active,
                write_set: BTreeMap::new(),
                tracked: BTreeSet::new(),
            }),
        }
    }

    /// This transaction's identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The transaction's read view.
    pub fn read_view(&self) -> &ReadView {
        &self.read_view
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.inner.read().map(|i| i.state).unwrap_or(TxState::Aborted)
    }

    fn write_locked(&self) -> Result<std::sync::RwLockWriteGuard<'_, TxInner>, TxError> {
        let inner = self
            .inner
            .write()
            .map_err(|_| TxError::Internal("tx lock poisoned".into()))?;
        if inner.state != TxState::Active {
            return Err(TxError::NotActive(self.id));
        }
        Ok(inner)
    }

    /// Stage a REPLACE of `tuple`.
    pub fn put(&self, index: &LsmIndex, tuple: Tuple) -> Result<(), TxError> {
        self.stage(index, Statement::replace(tuple, 0))
    }

    /// Stage an INSERT of `tuple`.
    pub fn insert(&self, index: &LsmIndex, tuple: Tuple) -> Result<(), TxError> {
        self.stage(index, Statement::insert(tuple, 0))
    }

    /// Stage a DELETE of `key`.
    pub fn delete(&self, index: &LsmIndex, key: Tuple) -> Result<(), TxError> {
        self.stage(index, Statement::delete(key, 0))
    }

    /// Stage an UPSERT.
    ///
    /// If an earlier statement for the key is already staged, the
    /// delta folds into it immediately and the write set keeps a
    /// terminal statement. A first-write upsert is kept raw.
    pub fn upsert(
        &self,
        index: &LsmIndex,
        tuple: Tuple,
        ops: Vec<UpsertOp>,
    ) -> Result<(), TxError> {
        let delta = Statement::upsert(tuple, ops, 0);
        let slot = (index.id(), delta.key_parts(index.cmp_def()));
        let mut inner = self.write_locked()?;
        let staged = match inner.write_set.get(&slot) {
            None => delta,
            Some(prev) => {
                let base = (prev.kind() != StmtKind::Delete).then_some(&**prev);
                if prev.kind() == StmtKind::Upsert {
                    // Two raw upserts stack: keep the older one's ops
                    // first, then the newer ones.
                    let mut ops = prev.ops().to_vec();
                    ops.extend_from_slice(delta.ops());
                    Statement::upsert(prev.tuple().clone(), ops, 0)
                } else {
                    apply_upsert(
                        &delta,
                        base,
                        index.cmp_def(),
                        index.mem_format(),
                        index.upsert_format(),
                        true,
                    )?
                }
            }
        };
        inner.write_set.insert(slot, staged);
        Ok(())
    }

    /// Stage a raw statement. Used directly by tests that need a
    /// hand-built write set; real writers go through the typed
    /// staging methods.
    pub fn stage(&self, index: &LsmIndex, stmt: StatementRef) -> Result<(), TxError> {
        let slot = (index.id(), stmt.key_parts(index.cmp_def()));
        let mut inner = self.write_locked()?;
        trace!(tx = self.id, key = ?slot.1, kind = ?stmt.kind(), "stage");
        inner.write_set.insert(slot, stmt);
        Ok(())
    }

    /// Exact-key lookup in this transaction's write set.
    pub fn write_set_search(
        &self,
        index_id: u64,
        key_parts: &[Field],
    ) -> Option<StatementRef> {
        let inner = self.inner.read().ok()?;
        inner
            .write_set
            .get(&(index_id, key_parts.to_vec()))
            .cloned()
    }

    /// Register a point-read intent on `(index, key)`.
    ///
    /// Any later commit of this key by another transaction will fix
    /// this transaction's read view at the pre-commit vlsn, so a
    /// lookup racing that commit cannot publish a stale cache entry.
    pub fn track_point(&self, index_id: u64, key_parts: &[Field]) -> Result<(), TxError> {
        let mut inner = self.write_locked()?;
        inner.tracked.insert((index_id, key_parts.to_vec()));
        Ok(())
    }

    fn tracks(&self, index_id: u64, key_parts: &[Field]) -> bool {
        self.inner
            .read()
            .map(|i| i.tracked.contains(&(index_id, key_parts.to_vec())))
            .unwrap_or(false)
    }
}

// ------------------------------------------------------------------------------------------------
// Transaction manager
// ------------------------------------------------------------------------------------------------

/// Allocates transaction ids and LSNs, and pushes conflicting readers
/// into read views at commit time.
pub struct TxManager {
    next_tx_id: AtomicU64,
    committed_lsn: AtomicI64,
    live: RwLock<Vec<Weak<Tx>>>,
}

impl TxManager {
    /// Creates a manager with no committed statements.
    pub fn new() -> Self {
        Self {
            next_tx_id: AtomicU64::new(1),
            committed_lsn: AtomicI64::new(0),
            live: RwLock::new(Vec::new()),
        }
    }

    /// Creates a manager whose LSN counter continues after `lsn`
    /// (recovery hand-off).
    pub fn with_committed_lsn(lsn: i64) -> Self {
        let mgr = Self::new();
        mgr.committed_lsn.store(lsn, Ordering::Release);
        mgr
    }

    /// Begin a new transaction.
    pub fn begin(&self) -> Result<Arc<Tx>, TxError> {
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        let tx = Arc::new(Tx::new(id));
        let mut live = self
            .live
            .write()
            .map_err(|_| TxError::Internal("tx registry poisoned".into()))?;
        live.retain(|weak| weak.strong_count() > 0);
        live.push(Arc::downgrade(&tx));
        Ok(tx)
    }

    /// The newest committed LSN.
    pub fn committed_lsn(&self) -> i64 {
        self.committed_lsn.load(Ordering::Acquire)
    }

    /// Commit `tx` into `index`.
    ///
    /// Assigns LSNs, inserts the write set into the active mem,
    /// invalidates cache entries for the written keys, and fixes the
    /// read view of every other live transaction that tracked one of
    /// those keys. Returns the last assigned LSN (the pre-commit vlsn
    /// when the write set is empty).
    pub fn commit(&self, tx: &Arc<Tx>, index: &LsmIndex) -> Result<i64, TxError> {
        let write_set = {
            let mut inner = tx.write_locked()?;
            inner.state = TxState::Committed;
            std::mem::take(&mut inner.write_set)
        };

        // Reject a mismatched write set before touching the index, so
        // a failed commit never applies half of one.
        if let Some(staged) = write_set
            .keys()
            .map(|(index_id, _)| *index_id)
            .find(|id| *id != index.id())
        {
            return Err(TxError::ForeignIndex {
                staged,
                committing: index.id(),
            });
        }

        let pre_commit_vlsn = self.committed_lsn();
        let mut lsn = pre_commit_vlsn;
        let mut written: Vec<Vec<Field>> = Vec::with_capacity(write_set.len());

        for ((_, key_parts), stmt) in write_set {
            lsn += 1;
            index.insert(stmt.with_lsn(lsn))?;
            index.cache().invalidate(&key_parts)?;
            written.push(key_parts);
        }
        self.committed_lsn.store(lsn, Ordering::Release);

        if !written.is_empty() {
            self.send_conflicting_to_read_view(tx.id(), index.id(), &written, pre_commit_vlsn)?;
        }
        debug!(tx = tx.id(), last_lsn = lsn, keys = written.len(), "commit");
        Ok(lsn)
    }

    /// Abort `tx`, discarding its write set.
    pub fn rollback(&self, tx: &Arc<Tx>) -> Result<(), TxError> {
        let mut inner = tx.write_locked()?;
        inner.state = TxState::Aborted;
        inner.write_set.clear();
        inner.tracked.clear();
        Ok(())
    }

    /// Fix the read view of every live transaction (other than the
    /// committer) that tracked one of the written keys and still sees
    /// the latest state.
    fn send_conflicting_to_read_view(
        &self,
        committer: u64,
        index_id: u64,
        written: &[Vec<Field>],
        vlsn: i64,
    ) -> Result<(), TxError> {
        let live = self
            .live
            .read()
            .map_err(|_| TxError::Internal("tx registry poisoned".into()))?;
        for weak in live.iter() {
            let Some(other) = weak.upgrade() else { continue };
            if other.id() == committer || !other.read_view().is_latest() {
                continue;
            }
            if written.iter().any(|key| other.tracks(index_id, key)) {
                debug!(tx = other.id(), vlsn, "sending conflicting reader to read view");
                other.read_view().fix(vlsn);
            }
        }
        Ok(())
    }
}

impl Default for TxManager {
    fn default() -> Self {
        Self::new()
    }
}
