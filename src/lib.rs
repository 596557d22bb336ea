//! # LapisDB
//!
//! An embeddable, **multi-version point-lookup engine** for LSM-tree
//! indexes. Given a fully-specified primary-key value and a read view,
//! it returns the single visible version of that key (or its absence),
//! reconciling data spread across four storage tiers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    point_lookup(key, rv)                   │
//! │                                                            │
//! │   ┌───────┐   ┌─────────┐   ┌─────────────┐   ┌─────────┐  │
//! │   │  TX   │ → │  Point  │ → │  Active +   │ → │ Slices  │  │
//! │   │ write │   │  cache  │   │ sealed mems │   │ (runs   │  │
//! │   │  set  │   │         │   │             │   │ on disk)│  │
//! │   └───────┘   └─────────┘   └─────────────┘   └─────────┘  │
//! │                                                            │
//! │   history of the key ──► upsert fold ──► result tuple      │
//! │                                  │                         │
//! │                                  └──► cache publication    │
//! │                                       (latest view only)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`lookup`] | The point-lookup core — tiered history scan, upsert fold, restart protocol |
//! | [`index`] | The LSM index — mem chain, ranges, statistics, configuration |
//! | [`mem`] | In-memory write buffers ordered by `(key ASC, LSN DESC)` |
//! | [`run`] | Immutable on-disk runs, slices with pin counts, EQ iterators |
//! | [`cache`] | Point cache with delete memoization and negative entries |
//! | [`tx`] | Transactions — write sets, point-read tracking, read views |
//! | [`stmt`] | Statements, tuples, comparators, and tuple formats |
//! | [`upsert`] | The upsert-combine function |
//! | [`encoding`] | Byte-stable binary encoding for the run file format |
//!
//! ## Key Features
//!
//! - **Multi-version reads** — every committed statement carries an LSN;
//!   a lookup resolves the newest version visible under its read view.
//! - **Tiered short-circuit** — tiers are scanned in a fixed order and
//!   the scan stops at the first terminal statement.
//! - **Upsert folding** — non-terminal deltas are combined over a
//!   terminal base, oldest-first, to produce the final tuple.
//! - **Liveness under concurrent dumps** — a mem-list version counter
//!   detects rotations and dumps that race a disk read; the lookup
//!   drops its history and restarts.
//! - **Read-view-aware caching** — only results obtained at the latest
//!   read view are published; deletes are memoized with their LSN so
//!   older views stay correct.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lapisdb::index::{IndexConfig, LsmIndex};
//! use lapisdb::stmt::{Statement, Tuple};
//! use lapisdb::tx::ReadView;
//!
//! let index = LsmIndex::open("/tmp/my_index", IndexConfig::default()).unwrap();
//!
//! // Populate the active mem directly (the write path assigns LSNs
//! // through the transaction manager in real deployments).
//! let row = Tuple::new(vec![b"5".to_vec(), b"hello".to_vec()]);
//! index.insert(Statement::replace(row, 1)).unwrap();
//!
//! // Point lookup at the latest read view.
//! let key = Tuple::new(vec![b"5".to_vec()]);
//! let found = index.get(None, &ReadView::latest(), &key).unwrap();
//! assert!(found.is_some());
//! ```

pub mod cache;
pub mod encoding;
pub mod errinj;
pub mod index;
pub mod lookup;
pub mod mem;
pub mod run;
pub mod stmt;
pub mod tx;
pub mod upsert;
