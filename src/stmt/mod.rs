//! Statements, tuples, comparators, and tuple formats.
//!
//! ## Statement model
//!
//! Every committed mutation is an immutable **statement**: a tagged
//! record `(kind, lsn, tuple)` where the kind is one of
//!
//! - [`StmtKind::Replace`] / [`StmtKind::Insert`] — a full row value;
//! - [`StmtKind::Delete`] — a tombstone carrying only the key parts;
//! - [`StmtKind::Upsert`] — a delta: an insert-tuple used when no base
//!   exists, plus a list of field operations applied when one does.
//!
//! REPLACE, INSERT, and DELETE are **terminal**: each fully determines
//! the key's value without needing an older base. UPSERT is
//! non-terminal and must be combined with a base by
//! [`apply_upsert`](crate::upsert::apply_upsert).
//!
//! Statements are shared between tiers (mems, cache, transaction write
//! sets, lookup histories) as [`StatementRef`] — an `Arc` whose clone
//! count is the statement's reference count.
//!
//! ## Tuples and comparison
//!
//! A [`Tuple`] is an ordered sequence of opaque byte-string fields. A
//! key is a tuple with at least [`CmpDef::part_count`] fields; two rows
//! belong to the same key iff their first `part_count` fields compare
//! equal, lexicographically field by field.

mod encoding_impls;


use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised when a tuple does not satisfy a [`TupleFormat`].
#[derive(Debug, Error)]
pub enum FormatError {
    /// The tuple has fewer fields than the format requires.
    #[error("tuple has {actual} fields, format {format_id} requires at least {required}")]
    TooFewFields {
        /// Identifier of the violated format.
        format_id: u32,
        /// Minimum field count the format demands.
        required: usize,
        /// Field count the tuple actually has.
        actual: usize,
    },

    /// A non-UPSERT statement carries update operations (or vice versa).
    #[error("statement kind {kind:?} is incompatible with format {format_id}")]
    KindMismatch {
        /// Identifier of the violated format.
        format_id: u32,
        /// Offending statement kind.
        kind: StmtKind,
    },
}

// ------------------------------------------------------------------------------------------------
// Tuple
// ------------------------------------------------------------------------------------------------

/// A single tuple field: an opaque byte string.
pub type Field = Vec<u8>;

/// An ordered sequence of opaque byte-string fields.
///
/// Tuples are the value currency of the engine: full rows, keys, and
/// upsert insert-tuples are all `Tuple`s. Field interpretation is left
/// to the caller, except for the integer-add upsert operation, which
/// requires its target field to be an 8-byte little-endian `i64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    fields: Vec<Field>,
}

impl Tuple {
    /// Creates a tuple from its fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Number of fields in the tuple.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Borrow field `idx`, or `None` past the end.
    pub fn field(&self, idx: usize) -> Option<&[u8]> {
        self.fields.get(idx).map(Vec::as_slice)
    }

    /// Borrow all fields.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Consume the tuple, yielding its fields.
    pub fn into_fields(self) -> Vec<Field> {
        self.fields
    }

    /// Replace field `idx` with `value`. Returns `false` if the index
    /// is out of range.
    pub(crate) fn set_field(&mut self, idx: usize, value: Field) -> bool {
        match self.fields.get_mut(idx) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Comparator
// ------------------------------------------------------------------------------------------------

/// A key comparator: the first `part_count` tuple fields form the key,
/// compared lexicographically field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmpDef {
    /// Number of leading tuple fields that form the key.
    pub part_count: usize,
}

impl CmpDef {
    /// Creates a comparator over the first `part_count` fields.
    pub fn new(part_count: usize) -> Self {
        Self { part_count }
    }

    /// Compare the key parts of two tuples.
    ///
    /// Missing fields compare as less than any present field, so a
    /// short key sorts before every full tuple sharing its prefix.
    pub fn compare(&self, a: &Tuple, b: &Tuple) -> Ordering {
        for part in 0..self.part_count {
            match (a.field(part), b.field(part)) {
                (Some(fa), Some(fb)) => match fa.cmp(fb) {
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

    /// Extract the key parts of `tuple` as an owned vector.
    pub fn key_parts(&self, tuple: &Tuple) -> Vec<Field> {
        tuple
            .fields()
            .iter()
            .take(self.part_count)
            .cloned()
            .collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Tuple formats
// ------------------------------------------------------------------------------------------------

/// A tuple format descriptor.
///
/// Formats gate what a tuple must look like in a given context: the
/// index's `mem_format` governs full rows in mems and fold results, the
/// `upsert_format` governs upsert insert-tuples, and the `disk_format`
/// governs statements decoded from run files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleFormat {
    /// Format identifier, used in diagnostics.
    pub id: u32,
    /// Minimum number of fields a conforming tuple must have.
    pub min_field_count: usize,
}

impl TupleFormat {
    /// Creates a format requiring at least `min_field_count` fields.
    pub fn new(id: u32, min_field_count: usize) -> Self {
        Self {
            id,
            min_field_count,
        }
    }

    /// Validate `tuple` against this format.
    pub fn validate(&self, tuple: &Tuple) -> Result<(), FormatError> {
        if tuple.field_count() < self.min_field_count {
            return Err(FormatError::TooFewFields {
                format_id: self.id,
                required: self.min_field_count,
                actual: tuple.field_count(),
            });
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Statement kinds
// ------------------------------------------------------------------------------------------------

/// The tag of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StmtKind {
    /// Replace the row unconditionally.
    Replace,
    /// Insert a row that must not already exist.
    Insert,
    /// Point tombstone: the key is deleted.
    Delete,
    /// Delta to be combined with an older base.
    Upsert,
}

impl StmtKind {
    /// A terminal statement fully determines the key's value without
    /// needing an older base.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StmtKind::Upsert)
    }
}

// ------------------------------------------------------------------------------------------------
// Upsert operations
// ------------------------------------------------------------------------------------------------

/// A single field operation carried by an UPSERT statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOp {
    /// Overwrite field `field` with `value`.
    Assign {
        /// Zero-based field index.
        field: u32,
        /// Replacement field value.
        value: Field,
    },

    /// Add `delta` to field `field`, which must hold an 8-byte
    /// little-endian `i64`.
    Add {
        /// Zero-based field index.
        field: u32,
        /// Signed addend.
        delta: i64,
    },
}

// ------------------------------------------------------------------------------------------------
// Statement
// ------------------------------------------------------------------------------------------------

/// A shared, immutable statement handle.
///
/// Cloning the `Arc` is the engine's "take a strong reference"
/// operation; `Arc::strong_count` is observable in tests to verify
/// that lookups release everything they acquire.
pub type StatementRef = Arc<Statement>;

/// An immutable tagged mutation record: `(kind, lsn, tuple [, ops])`.
///
/// For `Replace`/`Insert` the tuple is the full row. For `Delete` it
/// carries only the key parts. For `Upsert` it is the insert-tuple,
/// and `ops` holds the field operations applied when a base exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    kind: StmtKind,
    lsn: i64,
    tuple: Tuple,
    ops: Vec<UpsertOp>,
}

impl Statement {
    /// Creates a REPLACE statement.
    pub fn replace(tuple: Tuple, lsn: i64) -> StatementRef {
        Arc::new(Self {
            kind: StmtKind::Replace,
            lsn,
            tuple,
            ops: Vec::new(),
        })
    }

    /// Creates an INSERT statement.
    pub fn insert(tuple: Tuple, lsn: i64) -> StatementRef {
        Arc::new(Self {
            kind: StmtKind::Insert,
            lsn,
            tuple,
            ops: Vec::new(),
        })
    }

    /// Creates a DELETE tombstone. `key` should carry only key parts.
    pub fn delete(key: Tuple, lsn: i64) -> StatementRef {
        Arc::new(Self {
            kind: StmtKind::Delete,
            lsn,
            tuple: key,
            ops: Vec::new(),
        })
    }

    /// Creates an UPSERT delta from an insert-tuple and field ops.
    pub fn upsert(tuple: Tuple, ops: Vec<UpsertOp>, lsn: i64) -> StatementRef {
        Arc::new(Self {
            kind: StmtKind::Upsert,
            lsn,
            tuple,
            ops,
        })
    }

    /// The statement's tag.
    pub fn kind(&self) -> StmtKind {
        self.kind
    }

    /// The statement's log sequence number.
    pub fn lsn(&self) -> i64 {
        self.lsn
    }

    /// The statement's tuple payload.
    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    /// Update operations (empty unless the kind is UPSERT).
    pub fn ops(&self) -> &[UpsertOp] {
        &self.ops
    }

    /// Whether this statement terminates a key's history.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Rebuild this statement with a different lsn.
    ///
    /// Used by the commit path, which stages statements at lsn 0 and
    /// assigns real sequence numbers at commit time.
    pub fn with_lsn(&self, lsn: i64) -> StatementRef {
        Arc::new(Self {
            kind: self.kind,
            lsn,
            tuple: self.tuple.clone(),
            ops: self.ops.clone(),
        })
    }

    /// Compare this statement's key parts against a key tuple.
    pub fn compare_with_key(&self, key: &Tuple, cmp_def: &CmpDef) -> Ordering {
        cmp_def.compare(&self.tuple, key)
    }

    /// Extract this statement's key parts.
    pub fn key_parts(&self, cmp_def: &CmpDef) -> Vec<Field> {
        cmp_def.key_parts(&self.tuple)
    }

    /// Deep-copy this statement under `format`.
    ///
    /// The copy shares nothing with the original, so it stays valid
    /// after the tier that produced the original is reclaimed.
    pub fn dup(&self, format: &TupleFormat) -> Result<StatementRef, FormatError> {
        if self.kind != StmtKind::Delete {
            format.validate(&self.tuple)?;
        }
        Ok(Arc::new(Self {
            kind: self.kind,
            lsn: self.lsn,
            tuple: self.tuple.clone(),
            ops: self.ops.clone(),
        }))
    }
}
