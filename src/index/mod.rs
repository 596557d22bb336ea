//! The LSM index — mem chain, ranges, statistics, configuration.
//!
//! An [`LsmIndex`] owns the state a point lookup reconciles:
//!
//! 1. **Active mem** — the in-memory buffer receiving committed writes.
//! 2. **Sealed mems** — rotated-out buffers awaiting dump, newest
//!    first.
//! 3. **Ranges** — key intervals owning newest-first lists of slices
//!    over immutable on-disk runs.
//!
//! plus the point cache, per-tier statistics, and configuration.
//!
//! ## Mem-list versioning
//!
//! `mem_list_version` is bumped whenever the active mem rotates or a
//! sealed mem is dumped and dropped. A lookup snapshots the version
//! **and** the mem chain under one read-lock acquisition
//! ([`LsmIndex::mem_snapshot`]), reads runs without any lock, and
//! compares the version afterwards; a mismatch means the history it
//! collected may describe a chain that no longer exists, so it drops
//! the history and rereads. Rotation alone does not reclaim anything,
//! but it is indistinguishable from a dump at this layer and restarts
//! identically.
//!
//! ## Concurrency model
//!
//! The mem chain sits behind one `RwLock`; readers hold it only long
//! enough to clone `Arc` handles. Dumps hold the write lock for the
//! duration of the run build — lookups never wait on it while doing
//! I/O of their own.

pub mod stat;


pub use stat::{IndexStat, LatencySummary, TierStat};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{CacheError, PointCache};
use crate::errinj::ErrInj;
use crate::lookup::{self, LookupError};
use crate::mem::{Mem, MemError};
use crate::run::{Run, RunError, RunWriter, Slice};
use crate::stmt::{
    CmpDef, Field, FormatError, StatementRef, StmtKind, Tuple, TupleFormat,
};
use crate::tx::{ReadView, Tx};

/// Sub-directory holding run files.
pub const RUN_DIR: &str = "runs";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Error originating from a mem.
    #[error("mem error: {0}")]
    Mem(#[from] MemError),

    /// Error originating from the run subsystem.
    #[error("run error: {0}")]
    Run(#[from] RunError),

    /// Error originating from the point cache.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// A statement violated one of the index's tuple formats.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation (poisoned lock, missing range).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`LsmIndex`] instance.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Index identifier (0 for a primary index).
    pub id: u64,

    /// Number of leading tuple fields forming the key.
    pub part_count: usize,

    /// Minimum field count of a full row.
    pub row_field_count: usize,

    /// Lookups slower than this are reported with a warning.
    pub too_long_threshold: Duration,

    /// Max data block payload size in run files.
    pub run_block_size: usize,

    /// Bloom filter false-positive rate in run files.
    pub bloom_fpr: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            id: 0,
            part_count: 1,
            row_field_count: 1,
            too_long_threshold: Duration::from_millis(500),
            run_block_size: 4096,
            bloom_fpr: 0.01,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Ranges
// ------------------------------------------------------------------------------------------------

/// A contiguous key interval owning a newest-first list of slices.
pub struct Range {
    begin: Option<Vec<Field>>,
    end: Option<Vec<Field>>,
    slices: RwLock<Vec<Arc<Slice>>>,
}

impl Range {
    /// Creates a range over `[begin, end)`; `None` bounds are
    /// unbounded.
    pub fn new(begin: Option<Vec<Field>>, end: Option<Vec<Field>>) -> Self {
        Self {
            begin,
            end,
            slices: RwLock::new(Vec::new()),
        }
    }

    /// Whether `key_parts` falls inside this range.
    pub fn contains(&self, key_parts: &[Field]) -> bool {
        if let Some(begin) = &self.begin
            && key_parts < begin.as_slice()
        {
            return false;
        }
        if let Some(end) = &self.end
            && key_parts >= end.as_slice()
        {
            return false;
        }
        true
    }

    /// Snapshot the slice list, newest first.
    pub fn slices(&self) -> Vec<Arc<Slice>> {
        self.slices.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of slices.
    pub fn slice_count(&self) -> usize {
        self.slices.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Register a freshly dumped slice as the newest.
    fn add_slice_front(&self, slice: Arc<Slice>) -> Result<(), IndexError> {
        let mut slices = self
            .slices
            .write()
            .map_err(|_| IndexError::Internal("range lock poisoned".into()))?;
        slices.insert(0, slice);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Mem snapshot
// ------------------------------------------------------------------------------------------------

/// A consistent view of the mem chain, taken under one lock
/// acquisition together with the version that describes it.
pub struct MemSnapshot {
    /// `mem_list_version` at snapshot time.
    pub version: u64,
    /// The active mem.
    pub active: Arc<Mem>,
    /// Sealed mems, newest first.
    pub sealed: Vec<Arc<Mem>>,
}

struct IndexInner {
    active: Arc<Mem>,
    /// Sealed mems, newest first.
    sealed: Vec<Arc<Mem>>,
}

// ------------------------------------------------------------------------------------------------
// LsmIndex
// ------------------------------------------------------------------------------------------------

/// A single LSM index: the unit point lookups operate on.
pub struct LsmIndex {
    id: u64,
    cmp_def: CmpDef,
    mem_format: TupleFormat,
    upsert_format: TupleFormat,
    disk_format: TupleFormat,
    config: IndexConfig,
    data_dir: PathBuf,
    cache: PointCache,
    stat: IndexStat,
    errinj: ErrInj,
    mem_list_version: AtomicU64,
    mem_seq: AtomicU64,
    run_seq: AtomicU64,
    inner: RwLock<IndexInner>,
    ranges: RwLock<Vec<Arc<Range>>>,
}

impl LsmIndex {
    /// Opens (or creates) an index rooted at the given directory.
    ///
    /// The directory and its `runs/` sub-directory are created if
    /// missing. The index starts with an empty mem chain and a single
    /// range covering the whole key space; recovery of previously
    /// dumped runs is the responsibility of an outer engine layer.
    pub fn open(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self, IndexError> {
        let data_dir = path.as_ref().to_path_buf();
        fs::create_dir_all(data_dir.join(RUN_DIR))?;

        let cmp_def = CmpDef::new(config.part_count);
        let row_fields = config.row_field_count.max(config.part_count);
        let mem_format = TupleFormat::new(0, row_fields);
        let upsert_format = TupleFormat::new(1, row_fields);
        let disk_format = TupleFormat::new(2, config.part_count);

        info!(index = config.id, dir = %data_dir.display(), "opening index");
        Ok(Self {
            id: config.id,
            cmp_def,
            mem_format,
            upsert_format,
            disk_format,
            data_dir,
            cache: PointCache::new(),
            stat: IndexStat::new(),
            errinj: ErrInj::default(),
            mem_list_version: AtomicU64::new(0),
            mem_seq: AtomicU64::new(2),
            run_seq: AtomicU64::new(1),
            inner: RwLock::new(IndexInner {
                active: Arc::new(Mem::new(1, cmp_def)),
                sealed: Vec::new(),
            }),
            ranges: RwLock::new(vec![Arc::new(Range::new(None, None))]),
            config,
        })
    }

    /// Index identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The index's key comparator.
    pub fn cmp_def(&self) -> &CmpDef {
        &self.cmp_def
    }

    /// Format of full rows in mems and fold results.
    pub fn mem_format(&self) -> &TupleFormat {
        &self.mem_format
    }

    /// Format of upsert insert-tuples.
    pub fn upsert_format(&self) -> &TupleFormat {
        &self.upsert_format
    }

    /// Format of statements decoded from run files.
    pub fn disk_format(&self) -> &TupleFormat {
        &self.disk_format
    }

    /// The index's point cache.
    pub fn cache(&self) -> &PointCache {
        &self.cache
    }

    /// The index's statistics.
    pub fn stat(&self) -> &IndexStat {
        &self.stat
    }

    /// The index's error-injection registry (test support).
    pub fn errinj(&self) -> &ErrInj {
        &self.errinj
    }

    /// Lookups slower than this threshold are reported.
    pub fn too_long_threshold(&self) -> Duration {
        self.config.too_long_threshold
    }

    /// Insert a committed statement into the active mem.
    ///
    /// Non-tombstone statements must satisfy the mem format.
    pub fn insert(&self, stmt: StatementRef) -> Result<(), IndexError> {
        match stmt.kind() {
            StmtKind::Delete => {}
            StmtKind::Upsert => self.upsert_format.validate(stmt.tuple())?,
            _ => self.mem_format.validate(stmt.tuple())?,
        }
        let active = {
            let inner = self
                .inner
                .read()
                .map_err(|_| IndexError::Internal("index lock poisoned".into()))?;
            Arc::clone(&inner.active)
        };
        active.insert(stmt)?;
        Ok(())
    }

    /// Current mem-list version.
    pub fn mem_list_version(&self) -> u64 {
        self.mem_list_version.load(Ordering::Acquire)
    }

    /// Snapshot the mem chain and the version describing it under one
    /// lock acquisition.
    pub fn mem_snapshot(&self) -> Result<MemSnapshot, IndexError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| IndexError::Internal("index lock poisoned".into()))?;
        Ok(MemSnapshot {
            version: self.mem_list_version.load(Ordering::Acquire),
            active: Arc::clone(&inner.active),
            sealed: inner.sealed.clone(),
        })
    }

    /// Seal the active mem and install a fresh one.
    pub fn rotate_mem(&self) -> Result<(), IndexError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| IndexError::Internal("index lock poisoned".into()))?;
        let new_id = self.mem_seq.fetch_add(1, Ordering::Relaxed);
        let fresh = Arc::new(Mem::new(new_id, self.cmp_def));
        let sealed = std::mem::replace(&mut inner.active, fresh);
        debug!(index = self.id, mem = sealed.id(), "mem rotated");
        // Newest first, matching the order the lookup scans in.
        inner.sealed.insert(0, sealed);
        self.mem_list_version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Dump the oldest sealed mem to a run file and drop it.
    ///
    /// Returns `Ok(false)` when no sealed mem exists. An empty sealed
    /// mem is dropped without producing a file.
    pub fn dump_oldest_sealed(&self) -> Result<bool, IndexError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| IndexError::Internal("index lock poisoned".into()))?;
        let Some(mem) = inner.sealed.pop() else {
            return Ok(false);
        };

        if !mem.is_empty() {
            let stmts = mem.stmts_in_order()?;
            let run_id = self.run_seq.fetch_add(1, Ordering::Relaxed);
            let path = self.data_dir.join(RUN_DIR).join(format!("run-{run_id:06}.run"));
            RunWriter::new(&path)
                .block_size(self.config.run_block_size)
                .bloom_fpr(self.config.bloom_fpr)
                .build(&stmts, &self.cmp_def)?;
            let run = Arc::new(Run::open(&path, run_id, self.cmp_def)?);
            let slice = Arc::new(Slice::new(Arc::clone(&run), None, None));

            let range = self.find_range(&run.properties().min_key)?;
            range.add_slice_front(slice)?;
            info!(
                index = self.id,
                mem = mem.id(),
                run = run_id,
                stmts = run.properties().stmt_count,
                "mem dumped"
            );
        } else {
            debug!(index = self.id, mem = mem.id(), "empty sealed mem dropped");
        }

        self.mem_list_version.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Rotate the active mem and dump the whole sealed chain.
    pub fn dump_all(&self) -> Result<(), IndexError> {
        self.rotate_mem()?;
        while self.dump_oldest_sealed()? {}
        Ok(())
    }

    /// Find the unique range covering `key_parts`.
    pub fn find_range(&self, key_parts: &[Field]) -> Result<Arc<Range>, IndexError> {
        let ranges = self
            .ranges
            .read()
            .map_err(|_| IndexError::Internal("range set poisoned".into()))?;
        ranges
            .iter()
            .find(|range| range.contains(key_parts))
            .cloned()
            .ok_or_else(|| IndexError::Internal("no range covers the key".into()))
    }

    /// Point lookup: the single visible statement for `key` under
    /// `rv`, or `None` if the key is deleted or never existed.
    pub fn get(
        &self,
        tx: Option<&Tx>,
        rv: &ReadView,
        key: &Tuple,
    ) -> Result<Option<StatementRef>, LookupError> {
        lookup::point_lookup(self, tx, rv, key)
    }
}
