//! Point cache with delete memoization and negative entries.
//!
//! The cache stores, per key, the outcome of a previous point lookup
//! performed at the **latest** read view:
//!
//! - [`CachedValue::Statement`] — the fully-folded visible statement.
//!   For a deleted key this is the terminal DELETE itself, so a later
//!   lookup at an *older* read view still applies the proper
//!   `lsn ≤ vlsn` visibility check instead of trusting a stale
//!   absence.
//! - [`CachedValue::Absent`] — the key has no statements in any tier.
//!   View-independent until the next commit touching the key
//!   invalidates it.
//!
//! Only fully-folded, latest-view results are ever inserted; a cache
//! hit is therefore always terminal for the history builder.
//!
//! Eviction policy is out of scope here — the commit path keeps the
//! cache coherent by invalidating written keys, and tests exercise a
//! bounded working set.


use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::trace;

use crate::stmt::{Field, StatementRef};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`PointCache`] operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Cached values
// ------------------------------------------------------------------------------------------------

/// What the cache knows about a key.
#[derive(Debug, Clone)]
pub enum CachedValue {
    /// The latest folded statement (a REPLACE-like value, or the
    /// terminal DELETE memoizing an absence with its LSN).
    Statement(StatementRef),

    /// The key has no statements at all.
    Absent,
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Point-cache counters.
#[derive(Debug, Default)]
pub struct CacheStat {
    /// `get` calls.
    pub lookup: AtomicU64,
    /// `get` calls that found an entry.
    pub hit: AtomicU64,
    /// `add` calls.
    pub put: AtomicU64,
    /// `invalidate` calls that removed an entry.
    pub invalidate: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// PointCache
// ------------------------------------------------------------------------------------------------

/// An exact-key result cache for one index.
pub struct PointCache {
    entries: RwLock<HashMap<Vec<Field>, CachedValue>>,
    stat: CacheStat,
}

impl PointCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stat: CacheStat::default(),
        }
    }

    /// Exact-key lookup.
    pub fn get(&self, key_parts: &[Field]) -> Result<Option<CachedValue>, CacheError> {
        self.stat.lookup.fetch_add(1, Ordering::Relaxed);
        let entries = self
            .entries
            .read()
            .map_err(|_| CacheError::Internal("cache lock poisoned".into()))?;
        let found = entries.get(key_parts).cloned();
        if found.is_some() {
            self.stat.hit.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    /// Publish a lookup result for `key_parts`.
    ///
    /// The caller guarantees the value was folded at the latest read
    /// view; the cache does not re-derive visibility.
    pub fn add(&self, key_parts: Vec<Field>, value: CachedValue) -> Result<(), CacheError> {
        self.stat.put.fetch_add(1, Ordering::Relaxed);
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CacheError::Internal("cache lock poisoned".into()))?;
        trace!(?key_parts, "cache publish");
        entries.insert(key_parts, value);
        Ok(())
    }

    /// Drop the entry for `key_parts`, if any.
    ///
    /// Called by the commit path for every written key, so a cached
    /// value never outlives a newer committed version.
    pub fn invalidate(&self, key_parts: &[Field]) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CacheError::Internal("cache lock poisoned".into()))?;
        if entries.remove(key_parts).is_some() {
            self.stat.invalidate.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter access.
    pub fn stat(&self) -> &CacheStat {
        &self.stat
    }
}

impl Default for PointCache {
    fn default() -> Self {
        Self::new()
    }
}
