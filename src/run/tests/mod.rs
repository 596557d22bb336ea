
use std::sync::Arc;

use tempfile::TempDir;

use crate::run::{Run, RunWriter, Slice};
use crate::stmt::{CmpDef, Statement, StatementRef, Tuple};

pub(crate) fn cmp() -> CmpDef {
    CmpDef::new(1)
}

pub(crate) fn replace(key: &[u8], value: &[u8], lsn: i64) -> StatementRef {
    Statement::replace(Tuple::new(vec![key.to_vec(), value.to_vec()]), lsn)
}

pub(crate) fn delete(key: &[u8], lsn: i64) -> StatementRef {
    Statement::delete(Tuple::new(vec![key.to_vec()]), lsn)
}

pub(crate) fn key(k: &[u8]) -> Vec<Vec<u8>> {
    vec![k.to_vec()]
}

/// Build a run from pre-sorted statements and reopen it.
pub(crate) fn build_run(dir: &TempDir, stmts: &[StatementRef]) -> Arc<Run> {
    let path = dir.path().join("run-000001.run");
    RunWriter::new(&path)
        .block_size(64) // tiny blocks so multi-block paths are exercised
        .build(stmts, &cmp())
        .expect("build run");
    Arc::new(Run::open(&path, 1, cmp()).expect("open run"))
}

/// A slice covering the whole of `run`.
pub(crate) fn full_slice(run: Arc<Run>) -> Slice {
    Slice::new(run, None, None)
}
