mod tests_restart;
mod tests_scenarios;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::index::{IndexConfig, LsmIndex};
use crate::stmt::{Statement, StatementRef, Tuple, UpsertOp};
use crate::upsert::int_field;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call from
/// every test — only the first call takes effect.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open an index over two-field rows with a single-field key.
pub(crate) fn open_index(dir: &TempDir) -> LsmIndex {
    init_tracing();
    LsmIndex::open(
        dir.path(),
        IndexConfig {
            row_field_count: 2,
            run_block_size: 128, // small blocks, more of the disk path exercised
            ..IndexConfig::default()
        },
    )
    .expect("open index")
}

pub(crate) fn key(k: &[u8]) -> Tuple {
    Tuple::new(vec![k.to_vec()])
}

pub(crate) fn key_parts(k: &[u8]) -> Vec<Vec<u8>> {
    vec![k.to_vec()]
}

pub(crate) fn row(k: &[u8], v: &[u8]) -> Tuple {
    Tuple::new(vec![k.to_vec(), v.to_vec()])
}

pub(crate) fn int_row(k: &[u8], v: i64) -> Tuple {
    Tuple::new(vec![k.to_vec(), int_field(v)])
}

pub(crate) fn replace(k: &[u8], v: &[u8], lsn: i64) -> StatementRef {
    Statement::replace(row(k, v), lsn)
}

pub(crate) fn int_replace(k: &[u8], v: i64, lsn: i64) -> StatementRef {
    Statement::replace(int_row(k, v), lsn)
}

pub(crate) fn delete(k: &[u8], lsn: i64) -> StatementRef {
    Statement::delete(key(k), lsn)
}

pub(crate) fn add_upsert(k: &[u8], delta: i64, lsn: i64) -> StatementRef {
    Statement::upsert(
        int_row(k, 0),
        vec![UpsertOp::Add { field: 1, delta }],
        lsn,
    )
}

/// Second field of a result row.
pub(crate) fn value_of(stmt: &StatementRef) -> Vec<u8> {
    stmt.tuple().field(1).expect("two-field row").to_vec()
}
