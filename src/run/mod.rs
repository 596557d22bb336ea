//! Immutable on-disk runs, slices, and EQ iterators.
//!
//! A **run** is an immutable, sorted, disk-backed file of statements
//! produced by dumping a sealed mem. Statements are stored in
//! `(key parts ASC, LSN DESC)` order — the same order mems iterate in —
//! so all versions of one key form a contiguous descending-LSN span.
//!
//! A **slice** is a reference to a key-interval of a run. Ranges own
//! newest-first lists of slices; point lookups pin every slice of the
//! covering range before reading any of them, which keeps the span of
//! history complete even if a compactor wants to retire the run
//! mid-read.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM_LEN_LE][BLOOM_BYTES][BLOOM_CRC32_LE]
//! [PROPERTIES_LEN_LE][PROPERTIES_BYTES][PROPERTIES_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header** — magic, format version, CRC32.
//! - **Data blocks** — concatenated statement cells (see
//!   [`crate::stmt`] encoding impls).
//! - **Bloom block** — membership filter over key parts; negative
//!   point lookups skip the data blocks entirely.
//! - **Properties block** — statement count, min/max LSN, min/max key.
//! - **Index block** — first key + block handle per data block,
//!   enabling binary search for the block that may hold a key.
//! - **Footer** — handles of the bloom/properties/index blocks, total
//!   file size, CRC32, trailing magic.
//!
//! Every block carries its own CRC32; corruption is detected at read
//! time, never silently decoded.
//!
//! # Concurrency model
//!
//! Runs are immutable and memory-mapped; readers share them freely.
//! Pin counts on slices are atomic.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`RunWriter`] for building runs from sorted
//!   statement streams.
//! - [`iterator`] — [`RunIterator`] for visibility-clipped EQ reads.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::RunWriter;
pub use iterator::RunIterator;

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::stmt::{CmpDef, Field};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const RUN_HDR_MAGIC: [u8; 4] = *b"LRN1";
pub(crate) const RUN_FTR_MAGIC: [u8; 4] = *b"1NRL";
pub(crate) const RUN_HDR_VERSION: u32 = 1;
pub(crate) const RUN_HDR_SIZE: usize = 12;
pub(crate) const RUN_FOOTER_SIZE: usize = 64;
pub(crate) const RUN_BLOCK_LEN_SIZE: usize = 4;
pub(crate) const RUN_BLOCK_CRC_SIZE: usize = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by run operations (build, open, iterate).
#[derive(Debug, Error)]
pub enum RunError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A block or the header/footer failed its CRC check.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The file is structurally invalid.
    #[error("corrupt run file: {0}")]
    Corrupt(String),

    /// The statement stream handed to the builder was out of order.
    #[error("unsorted input: {0}")]
    UnsortedInput(String),

    /// The builder was given no statements.
    #[error("cannot build an empty run")]
    EmptyInput,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Run file header.
#[derive(Debug, Default)]
pub(crate) struct RunHeader {
    pub(crate) magic: [u8; 4],
    pub(crate) version: u32,
    /// CRC32 of the header with this field zeroed.
    pub(crate) crc: u32,
}

/// Handle to a block: offset of its length prefix, and total size
/// including the length prefix and trailing CRC.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

/// Run-level metadata.
#[derive(Debug, Clone)]
pub struct RunProperties {
    /// Total number of statement cells.
    pub stmt_count: u64,
    /// Smallest LSN present.
    pub min_lsn: i64,
    /// Largest LSN present.
    pub max_lsn: i64,
    /// Smallest key parts present.
    pub min_key: Vec<Field>,
    /// Largest key parts present.
    pub max_key: Vec<Field>,
}

/// Index entry: the key parts of the first cell in a data block.
#[derive(Debug, Clone)]
pub(crate) struct RunIndexEntry {
    pub(crate) first_key: Vec<Field>,
    pub(crate) handle: BlockHandle,
}

/// Run file footer, stored at the very end of the file.
#[derive(Debug, Default)]
pub(crate) struct RunFooter {
    pub(crate) bloom: BlockHandle,
    pub(crate) properties: BlockHandle,
    pub(crate) index: BlockHandle,
    pub(crate) total_file_size: u64,
    /// CRC32 of the footer with this field zeroed.
    pub(crate) crc: u32,
    pub(crate) magic: [u8; 4],
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for RunHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.crc.encode_to(buf)
    }
}

impl Decode for RunHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (magic, mut off) = <[u8; 4]>::decode_from(buf)?;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { magic, version, crc }, off))
    }
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (offset, mut off) = u64::decode_from(buf)?;
        let (size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { offset, size }, off))
    }
}

impl Encode for RunProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.stmt_count.encode_to(buf)?;
        self.min_lsn.encode_to(buf)?;
        self.max_lsn.encode_to(buf)?;
        encoding::encode_vec(&self.min_key, buf)?;
        encoding::encode_vec(&self.max_key, buf)
    }
}

impl Decode for RunProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (stmt_count, mut off) = u64::decode_from(buf)?;
        let (min_lsn, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (max_lsn, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (min_key, n) = encoding::decode_vec::<Vec<u8>>(&buf[off..])?;
        off += n;
        let (max_key, n) = encoding::decode_vec::<Vec<u8>>(&buf[off..])?;
        off += n;
        Ok((
            Self {
                stmt_count,
                min_lsn,
                max_lsn,
                min_key,
                max_key,
            },
            off,
        ))
    }
}

impl Encode for RunIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.first_key, buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for RunIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (first_key, mut off) = encoding::decode_vec::<Vec<u8>>(buf)?;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { first_key, handle }, off))
    }
}

impl Encode for RunFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.bloom.encode_to(buf)?;
        self.properties.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.total_file_size.encode_to(buf)?;
        self.crc.encode_to(buf)?;
        self.magic.encode_to(buf)
    }
}

impl Decode for RunFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bloom, mut off) = BlockHandle::decode_from(buf)?;
        let (properties, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (index, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (total_file_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                bloom,
                properties,
                index,
                total_file_size,
                crc,
                magic,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Run — immutable reader
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable run file.
pub struct Run {
    id: u64,
    cmp_def: CmpDef,
    mmap: Mmap,
    bloom: Vec<u8>,
    properties: RunProperties,
    index: Vec<RunIndexEntry>,
}

impl Run {
    /// Opens a run from disk, verifying header, footer, and the bloom,
    /// properties, and index blocks.
    ///
    /// Data blocks are verified lazily when an iterator reads them.
    ///
    /// The mmap is read-only and the file is never written after
    /// creation, so the `unsafe` map cannot observe mutation.
    pub fn open(path: impl AsRef<Path>, id: u64, cmp_def: CmpDef) -> Result<Self, RunError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < RUN_HDR_SIZE + RUN_FOOTER_SIZE {
            return Err(RunError::Corrupt("file too small".into()));
        }

        let (mut header, _) = encoding::decode_from_slice::<RunHeader>(&mmap[..RUN_HDR_SIZE])?;
        let stored = header.crc;
        header.crc = 0;
        if stored != crc32_of(&encoding::encode_to_vec(&header)?) {
            return Err(RunError::ChecksumMismatch);
        }
        if header.magic != RUN_HDR_MAGIC {
            return Err(RunError::Corrupt("header magic mismatch".into()));
        }
        if header.version != RUN_HDR_VERSION {
            return Err(RunError::Corrupt(format!(
                "unsupported format version {}",
                header.version
            )));
        }

        let footer_start = mmap.len() - RUN_FOOTER_SIZE;
        let (mut footer, _) = encoding::decode_from_slice::<RunFooter>(&mmap[footer_start..])?;
        let stored = footer.crc;
        footer.crc = 0;
        if stored != crc32_of(&encoding::encode_to_vec(&footer)?) {
            return Err(RunError::ChecksumMismatch);
        }
        if footer.magic != RUN_FTR_MAGIC {
            return Err(RunError::Corrupt("footer magic mismatch".into()));
        }
        if footer.total_file_size != mmap.len() as u64 {
            return Err(RunError::Corrupt("file size mismatch".into()));
        }

        let bloom = read_block_bytes(&mmap, &footer.bloom)?;
        let props_bytes = read_block_bytes(&mmap, &footer.properties)?;
        let (properties, _) = encoding::decode_from_slice::<RunProperties>(&props_bytes)?;
        let index_bytes = read_block_bytes(&mmap, &footer.index)?;
        let (index, _) = encoding::decode_vec::<RunIndexEntry>(&index_bytes)?;
        if index.is_empty() {
            return Err(RunError::Corrupt("run has no data blocks".into()));
        }

        Ok(Self {
            id,
            cmp_def,
            mmap,
            bloom,
            properties,
            index,
        })
    }

    /// This run's identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The comparator the run is sorted by.
    pub fn cmp_def(&self) -> &CmpDef {
        &self.cmp_def
    }

    /// Run-level metadata.
    pub fn properties(&self) -> &RunProperties {
        &self.properties
    }

    /// Whether `key_parts` *might* be present, per the bloom filter.
    ///
    /// `false` is definitive; `true` means the data blocks must be
    /// consulted. A missing or corrupt bloom cannot exclude anything.
    pub fn bloom_may_contain(&self, key_parts: &[Field]) -> bool {
        if self.bloom.is_empty() {
            return true;
        }
        match Bloom::<Vec<u8>>::from_slice(&self.bloom) {
            Ok(bloom) => bloom.check(&bloom_key(key_parts)),
            Err(_) => true,
        }
    }

    pub(crate) fn index_entries(&self) -> &[RunIndexEntry] {
        &self.index
    }

    /// Read and verify the data block at `block_idx`.
    pub(crate) fn data_block(&self, block_idx: usize) -> Result<Vec<u8>, RunError> {
        let entry = self
            .index
            .get(block_idx)
            .ok_or_else(|| RunError::Internal(format!("data block {block_idx} out of range")))?;
        read_block_bytes(&self.mmap, &entry.handle)
    }
}

/// Flatten key parts into the byte string fed to the bloom filter.
pub(crate) fn bloom_key(key_parts: &[Field]) -> Vec<u8> {
    // Length-prefixed concatenation keeps multi-part keys unambiguous.
    let mut buf = Vec::new();
    for part in key_parts {
        buf.extend_from_slice(&(part.len() as u32).to_le_bytes());
        buf.extend_from_slice(part);
    }
    buf
}

pub(crate) fn crc32_of(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Read a `[u32 len][bytes][u32 crc]` block and verify its checksum.
pub(crate) fn read_block_bytes(mmap: &Mmap, handle: &BlockHandle) -> Result<Vec<u8>, RunError> {
    let offset = handle.offset as usize;
    let size = handle.size as usize;
    if size < RUN_BLOCK_LEN_SIZE + RUN_BLOCK_CRC_SIZE
        || offset.checked_add(size).is_none_or(|end| end > mmap.len())
    {
        return Err(RunError::Corrupt("block handle out of bounds".into()));
    }
    let (len, _) = encoding::decode_from_slice::<u32>(&mmap[offset..offset + RUN_BLOCK_LEN_SIZE])?;
    let len = len as usize;
    if RUN_BLOCK_LEN_SIZE + len + RUN_BLOCK_CRC_SIZE != size {
        return Err(RunError::Corrupt("block length disagrees with handle".into()));
    }
    let data_start = offset + RUN_BLOCK_LEN_SIZE;
    let data = &mmap[data_start..data_start + len];
    let (stored, _) =
        encoding::decode_from_slice::<u32>(&mmap[data_start + len..data_start + len + 4])?;
    if stored != crc32_of(data) {
        return Err(RunError::ChecksumMismatch);
    }
    Ok(data.to_vec())
}

// ------------------------------------------------------------------------------------------------
// Slice — a pinned window into a run
// ------------------------------------------------------------------------------------------------

/// A reference to the key interval `[begin, end)` of a run.
///
/// `None` bounds are unbounded. The pin count is the contract between
/// readers and the compactor: a run whose slices carry pins must not
/// be retired.
pub struct Slice {
    run: Arc<Run>,
    begin: Option<Vec<Field>>,
    end: Option<Vec<Field>>,
    pins: AtomicU64,
}

impl Slice {
    /// Creates a slice over `[begin, end)` of `run`.
    pub fn new(run: Arc<Run>, begin: Option<Vec<Field>>, end: Option<Vec<Field>>) -> Self {
        Self {
            run,
            begin,
            end,
            pins: AtomicU64::new(0),
        }
    }

    /// The underlying run.
    pub fn run(&self) -> &Arc<Run> {
        &self.run
    }

    /// Whether `key_parts` falls inside this slice's interval.
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

    /// Take a pin, blocking the run's retirement.
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a pin taken by [`Slice::pin`].
    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "slice unpin without a matching pin");
    }

    /// Current pin count.
    pub fn pin_count(&self) -> u64 {
        self.pins.load(Ordering::Acquire)
    }
}
