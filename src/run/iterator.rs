//! Visibility-clipped EQ iteration over a slice — [`RunIterator`].
//!
//! A run iterator is opened per slice with a key and a visibility
//! horizon. [`RunIterator::next_key`] positions on the newest
//! statement of the key with `lsn ≤ vlsn`; [`RunIterator::next_lsn`]
//! then steps through strictly older versions of the same key. The
//! file's `(key ASC, LSN DESC)` order makes both a forward walk.
//!
//! Reading a data block touches the mmap and may fault pages in from
//! disk — this is the only place a point lookup performs I/O, and
//! therefore the window the mem-list invalidation protocol guards.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::encoding;
use crate::stmt::{Field, Statement, StatementRef};

use super::{RunError, Slice};

/// An EQ iterator over one slice.
pub struct RunIterator {
    run: Arc<super::Run>,
    key_parts: Vec<Field>,
    vlsn: i64,
    /// Index of the block the cursor is in.
    block_idx: usize,
    /// Decoded bytes of the current block, empty until first load.
    block: Vec<u8>,
    /// Byte offset of the next cell within `block`.
    offset: usize,
    loaded: bool,
    exhausted: bool,
}

impl RunIterator {
    /// Opens an iterator over `slice` for `key_parts` at `vlsn`.
    ///
    /// Consults the bloom filter and the block index; a definitive
    /// bloom miss or an out-of-bounds key yields an already-exhausted
    /// iterator without touching any data block.
    pub fn open(slice: &Slice, key_parts: &[Field], vlsn: i64) -> Result<Self, RunError> {
        let run = Arc::clone(slice.run());
        let mut iter = Self {
            run,
            key_parts: key_parts.to_vec(),
            vlsn,
            block_idx: 0,
            block: Vec::new(),
            offset: 0,
            loaded: false,
            exhausted: false,
        };

        if !slice.contains(key_parts) || !iter.run.bloom_may_contain(key_parts) {
            iter.exhausted = true;
        } else {
            // Start at the last block whose first key is strictly
            // below the target. The target's version span begins
            // either inside that block or at the head of the next one;
            // consecutive blocks can share the target as their first
            // key, so seeking by `≤` could skip the span's newest part.
            let start = iter
                .run
                .index_entries()
                .partition_point(|entry| entry.first_key.as_slice() < key_parts);
            iter.block_idx = start.saturating_sub(1);
        }
        Ok(iter)
    }

    /// Position on the newest statement of the key visible at the
    /// iterator's horizon. Returns `None` if the slice holds no
    /// visible version.
    pub fn next_key(&mut self) -> Result<Option<StatementRef>, RunError> {
        loop {
            let Some(stmt) = self.advance()? else {
                return Ok(None);
            };
            match self.cmp_with_target(&stmt) {
                Ordering::Less => continue,
                Ordering::Greater => {
                    self.exhausted = true;
                    return Ok(None);
                }
                Ordering::Equal => {
                    if stmt.lsn() <= self.vlsn {
                        return Ok(Some(Arc::new(stmt)));
                    }
                    // Newer than the horizon; older versions follow.
                    continue;
                }
            }
        }
    }

    /// Step to the next older version of the key.
    ///
    /// Valid only after [`RunIterator::next_key`] returned a
    /// statement; versions arrive in strictly decreasing LSN order,
    /// so everything after a visible statement is visible too.
    pub fn next_lsn(&mut self) -> Result<Option<StatementRef>, RunError> {
        let Some(stmt) = self.advance()? else {
            return Ok(None);
        };
        if self.cmp_with_target(&stmt) != Ordering::Equal {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(Some(Arc::new(stmt)))
    }

    /// Compare a cell's key parts against the target key.
    fn cmp_with_target(&self, stmt: &Statement) -> Ordering {
        let part_count = self.run.cmp_def().part_count;
        for idx in 0..part_count {
            let target = self.key_parts.get(idx).map(Vec::as_slice);
            match (stmt.tuple().field(idx), target) {
                (Some(a), Some(b)) => match a.cmp(b) {
                    Ordering::Equal => continue,
                    other => return other,
                },
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
            }
        }
        Ordering::Equal
    }

    /// Decode the next cell in file order, crossing block boundaries.
    fn advance(&mut self) -> Result<Option<Statement>, RunError> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            if !self.loaded {
                self.block = self.run.data_block(self.block_idx)?;
                self.offset = 0;
                self.loaded = true;
            }
            if self.offset >= self.block.len() {
                if self.block_idx + 1 >= self.run.index_entries().len() {
                    self.exhausted = true;
                    return Ok(None);
                }
                self.block_idx += 1;
                self.loaded = false;
                continue;
            }
            let (stmt, consumed) =
                encoding::decode_from_slice::<Statement>(&self.block[self.offset..])?;
            self.offset += consumed;
            return Ok(Some(stmt));
        }
    }
}
