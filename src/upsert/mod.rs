//! The upsert-combine function.
//!
//! An UPSERT statement is a delta: it carries an insert-tuple (the row
//! to use when the key does not exist) and a list of field operations
//! (applied when it does). [`apply_upsert`] combines one delta with an
//! optional base statement and yields a terminal REPLACE.
//!
//! The lookup folder walks a key's history last-to-first, seeding from
//! the terminal statement and calling [`apply_upsert`] once per delta,
//! so the newest delta is applied last and the result carries its lsn.
//!
//! ## Operation failures
//!
//! A field operation can be invalid against a concrete base: the field
//! index may be out of range, or an integer add may target a field that
//! is not an 8-byte little-endian `i64`. With `suppress_op_errors` set
//! (the engine's fold always sets it), such operations are skipped with
//! a warning and the remaining operations still apply — a malformed
//! committed delta must not make the key permanently unreadable.
//! Without it, the first invalid operation fails the combine.
//!
//! Either way, the combined tuple must still satisfy `mem_format`;
//! a violation is always an error.


use thiserror::Error;
use tracing::warn;

use crate::stmt::{
    CmpDef, Statement, StatementRef, StmtKind, Tuple, TupleFormat, UpsertOp,
};

/// Errors returned by [`apply_upsert`].
#[derive(Debug, Error)]
pub enum UpsertError {
    /// The delta statement is not an UPSERT.
    #[error("expected an UPSERT delta, got {0:?}")]
    NotAnUpsert(StmtKind),

    /// An operation referenced a field past the end of the tuple.
    #[error("op targets field {field}, tuple has {field_count} fields")]
    FieldOutOfRange {
        /// Field index the operation referenced.
        field: u32,
        /// Field count of the tuple being updated.
        field_count: usize,
    },

    /// An integer add targeted a field that is not an 8-byte `i64`.
    #[error("add op targets field {field} of {len} bytes (need 8)")]
    NotAnInteger {
        /// Field index the operation referenced.
        field: u32,
        /// Actual byte length of the field.
        len: usize,
    },

    /// An integer add overflowed.
    #[error("add op on field {field} overflowed")]
    Overflow {
        /// Field index the operation referenced.
        field: u32,
    },

    /// The combined tuple violates the mem format.
    #[error("combined tuple violates format: {0}")]
    Format(#[from] crate::stmt::FormatError),
}

/// Combine an UPSERT `delta` with an optional terminal `base`.
///
/// - Absent base: the delta's insert-tuple becomes the row.
/// - Present base: the delta's operations are applied to a copy of the
///   base tuple.
///
/// The result is a REPLACE carrying the delta's lsn. `cmp_def` is used
/// for diagnostics only — operations never change key parts here
/// because the write path rejects key-mutating upserts before commit.
pub fn apply_upsert(
    delta: &Statement,
    base: Option<&Statement>,
    cmp_def: &CmpDef,
    mem_format: &TupleFormat,
    upsert_format: &TupleFormat,
    suppress_op_errors: bool,
) -> Result<StatementRef, UpsertError> {
    if delta.kind() != StmtKind::Upsert {
        return Err(UpsertError::NotAnUpsert(delta.kind()));
    }
    upsert_format.validate(delta.tuple())?;

    let tuple = match base {
        None => delta.tuple().clone(),
        Some(base) => {
            let mut tuple = base.tuple().clone();
            for op in delta.ops() {
                match apply_op(&mut tuple, op) {
                    Ok(()) => {}
                    Err(err) if suppress_op_errors => {
                        warn!(
                            key = ?delta.key_parts(cmp_def),
                            lsn = delta.lsn(),
                            %err,
                            "skipping invalid upsert op"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            tuple
        }
    };

    mem_format.validate(&tuple)?;
    Ok(Statement::replace(tuple, delta.lsn()))
}

/// Apply one field operation to `tuple` in place.
fn apply_op(tuple: &mut Tuple, op: &UpsertOp) -> Result<(), UpsertError> {
    match op {
        UpsertOp::Assign { field, value } => {
            if !tuple.set_field(*field as usize, value.clone()) {
                return Err(UpsertError::FieldOutOfRange {
                    field: *field,
                    field_count: tuple.field_count(),
                });
            }
            Ok(())
        }
        UpsertOp::Add { field, delta } => {
            let current = tuple.field(*field as usize).ok_or(UpsertError::FieldOutOfRange {
                field: *field,
                field_count: tuple.field_count(),
            })?;
            let bytes: [u8; 8] = current.try_into().map_err(|_| UpsertError::NotAnInteger {
                field: *field,
                len: current.len(),
            })?;
            let sum = i64::from_le_bytes(bytes)
                .checked_add(*delta)
                .ok_or(UpsertError::Overflow { field: *field })?;
            tuple.set_field(*field as usize, sum.to_le_bytes().to_vec());
            Ok(())
        }
    }
}

/// Encode an `i64` as an 8-byte little-endian tuple field.
///
/// Convenience for building rows whose fields participate in
/// [`UpsertOp::Add`] operations.
pub fn int_field(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode an 8-byte little-endian tuple field back into an `i64`.
pub fn field_int(field: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = field.try_into().ok()?;
    Some(i64::from_le_bytes(bytes))
}
