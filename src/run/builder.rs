//! Run construction — [`RunWriter`].
//!
//! Builds an immutable run file from a statement stream already sorted
//! by `(key parts ASC, LSN DESC)` — the order a sealed mem iterates in.
//! The input order is verified, not trusted: a violation aborts the
//! build, because a mis-sorted run would silently corrupt every future
//! lookup that touches it.
//!
//! The file is written to a temporary sibling path and renamed into
//! place on success, so a crash mid-build never leaves a partial run
//! where the index discovers files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use tracing::{debug, info};

use crate::encoding::{self, Encode};
use crate::stmt::{CmpDef, Field, StatementRef};

use super::{
    BlockHandle, RUN_HDR_MAGIC, RUN_HDR_VERSION, RunError, RunFooter, RunHeader, RunIndexEntry,
    RunProperties, bloom_key, crc32_of,
};

/// Default max data block payload size.
const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default bloom filter false-positive rate.
const DEFAULT_BLOOM_FPR: f64 = 0.01;

/// Builder for immutable run files.
pub struct RunWriter {
    path: PathBuf,
    block_size: usize,
    bloom_fpr: f64,
}

impl RunWriter {
    /// Creates a writer targeting `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            block_size: DEFAULT_BLOCK_SIZE,
            bloom_fpr: DEFAULT_BLOOM_FPR,
        }
    }

    /// Override the data block payload size.
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Override the bloom filter false-positive rate.
    pub fn bloom_fpr(mut self, fpr: f64) -> Self {
        self.bloom_fpr = fpr;
        self
    }

    /// Build the run from `stmts`, which must be sorted by
    /// `(key parts ASC, LSN DESC)` under `cmp_def`.
    pub fn build(self, stmts: &[StatementRef], cmp_def: &CmpDef) -> Result<(), RunError> {
        if stmts.is_empty() {
            return Err(RunError::EmptyInput);
        }
        verify_sorted(stmts, cmp_def)?;

        let mut bloom: Bloom<Vec<u8>> = Bloom::new_for_fp_rate(stmts.len(), self.bloom_fpr)
            .map_err(|e| RunError::Internal(format!("bloom construction failed: {e}")))?;

        let mut buf = Vec::new();

        // Header, CRC computed over itself with the crc field zeroed.
        let mut header = RunHeader {
            magic: RUN_HDR_MAGIC,
            version: RUN_HDR_VERSION,
            crc: 0,
        };
        header.crc = crc32_of(&encoding::encode_to_vec(&header)?);
        header.encode_to(&mut buf)?;

        // Data blocks.
        let mut index: Vec<RunIndexEntry> = Vec::new();
        let mut current_block: Vec<u8> = Vec::new();
        let mut current_first_key: Option<Vec<Field>> = None;

        let mut min_lsn = i64::MAX;
        let mut max_lsn = i64::MIN;

        for stmt in stmts {
            let key_parts = stmt.key_parts(cmp_def);
            bloom.set(&bloom_key(&key_parts));
            min_lsn = min_lsn.min(stmt.lsn());
            max_lsn = max_lsn.max(stmt.lsn());

            if current_first_key.is_none() {
                current_first_key = Some(key_parts);
            }
            stmt.encode_to(&mut current_block)?;

            if current_block.len() >= self.block_size {
                let first_key = current_first_key.take().unwrap_or_default();
                let handle = append_block(&mut buf, &current_block)?;
                index.push(RunIndexEntry { first_key, handle });
                current_block.clear();
            }
        }
        if !current_block.is_empty() {
            let first_key = current_first_key.take().unwrap_or_default();
            let handle = append_block(&mut buf, &current_block)?;
            index.push(RunIndexEntry { first_key, handle });
        }

        // Bloom block.
        let bloom_handle = append_block(&mut buf, bloom.as_slice())?;

        // Properties block.
        let properties = RunProperties {
            stmt_count: stmts.len() as u64,
            min_lsn,
            max_lsn,
            min_key: stmts[0].key_parts(cmp_def),
            max_key: stmts[stmts.len() - 1].key_parts(cmp_def),
        };
        let props_handle = append_block(&mut buf, &encoding::encode_to_vec(&properties)?)?;

        // Index block.
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&index, &mut index_bytes)?;
        let index_handle = append_block(&mut buf, &index_bytes)?;

        // Footer, CRC computed over itself with the crc field zeroed.
        let mut footer = RunFooter {
            bloom: bloom_handle,
            properties: props_handle,
            index: index_handle,
            total_file_size: (buf.len() + super::RUN_FOOTER_SIZE) as u64,
            crc: 0,
            magic: super::RUN_FTR_MAGIC,
        };
        footer.crc = crc32_of(&encoding::encode_to_vec(&footer)?);
        footer.encode_to(&mut buf)?;

        // Write atomically: temporary sibling, fsync, rename.
        let tmp_path = self.path.with_extension("run.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        info!(
            path = %self.path.display(),
            stmts = stmts.len(),
            blocks = index.len(),
            bytes = buf.len(),
            "run built"
        );
        Ok(())
    }
}

/// Append a `[u32 len][bytes][u32 crc]` block to `buf`, returning its
/// handle.
fn append_block(buf: &mut Vec<u8>, data: &[u8]) -> Result<BlockHandle, RunError> {
    let offset = buf.len() as u64;
    (data.len() as u32).encode_to(buf)?;
    buf.extend_from_slice(data);
    crc32_of(data).encode_to(buf)?;
    debug!(offset, len = data.len(), "block appended");
    Ok(BlockHandle {
        offset,
        size: (super::RUN_BLOCK_LEN_SIZE + data.len() + super::RUN_BLOCK_CRC_SIZE) as u64,
    })
}

/// Verify `(key parts ASC, LSN DESC)` order.
fn verify_sorted(stmts: &[StatementRef], cmp_def: &CmpDef) -> Result<(), RunError> {
    for pair in stmts.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        match cmp_def.compare(prev.tuple(), next.tuple()) {
            std::cmp::Ordering::Less => {}
            std::cmp::Ordering::Equal => {
                if next.lsn() >= prev.lsn() {
                    return Err(RunError::UnsortedInput(format!(
                        "duplicate key with non-descending lsn ({} then {})",
                        prev.lsn(),
                        next.lsn()
                    )));
                }
            }
            std::cmp::Ordering::Greater => {
                return Err(RunError::UnsortedInput(
                    "keys out of ascending order".into(),
                ));
            }
        }
    }
    Ok(())
}
