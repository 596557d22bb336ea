//! Encode / Decode implementations for statement types.
//!
//! Kept apart from `mod.rs` for readability — the implementations are
//! purely mechanical serialisation logic. These forms are used only
//! inside run files; they are not a public wire format.

use super::{Statement, StmtKind, Tuple, UpsertOp};
use crate::encoding::{Decode, Encode, EncodingError, decode_vec, encode_vec};

// ------------------------------------------------------------------------------------------------
// Encode / Decode — StmtKind
// ------------------------------------------------------------------------------------------------

impl Encode for StmtKind {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self {
            StmtKind::Replace => 0,
            StmtKind::Insert => 1,
            StmtKind::Delete => 2,
            StmtKind::Upsert => 3,
        };
        tag.encode_to(buf)
    }
}

impl Decode for StmtKind {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, consumed) = u8::decode_from(buf)?;
        let kind = match tag {
            0 => StmtKind::Replace,
            1 => StmtKind::Insert,
            2 => StmtKind::Delete,
            3 => StmtKind::Upsert,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "StmtKind",
                });
            }
        };
        Ok((kind, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Encode / Decode — UpsertOp
// ------------------------------------------------------------------------------------------------

impl Encode for UpsertOp {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            UpsertOp::Assign { field, value } => {
                0u8.encode_to(buf)?;
                field.encode_to(buf)?;
                value.encode_to(buf)?;
            }
            UpsertOp::Add { field, delta } => {
                1u8.encode_to(buf)?;
                field.encode_to(buf)?;
                delta.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for UpsertOp {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        match tag {
            0 => {
                let (field, n) = u32::decode_from(&buf[offset..])?;
                offset += n;
                let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((UpsertOp::Assign { field, value }, offset))
            }
            1 => {
                let (field, n) = u32::decode_from(&buf[offset..])?;
                offset += n;
                let (delta, n) = i64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((UpsertOp::Add { field, delta }, offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "UpsertOp",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Encode / Decode — Tuple
// ------------------------------------------------------------------------------------------------

impl Encode for Tuple {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_vec(self.fields(), buf)
    }
}

impl Decode for Tuple {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (fields, consumed) = decode_vec::<Vec<u8>>(buf)?;
        Ok((Tuple::new(fields), consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Encode / Decode — Statement
// ------------------------------------------------------------------------------------------------

impl Encode for Statement {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.kind().encode_to(buf)?;
        self.lsn().encode_to(buf)?;
        self.tuple().encode_to(buf)?;
        encode_vec(self.ops(), buf)
    }
}

impl Decode for Statement {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (kind, mut offset) = StmtKind::decode_from(buf)?;
        let (lsn, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (tuple, n) = Tuple::decode_from(&buf[offset..])?;
        offset += n;
        let (ops, n) = decode_vec::<UpsertOp>(&buf[offset..])?;
        offset += n;

        if kind != StmtKind::Upsert && !ops.is_empty() {
            return Err(EncodingError::Custom(format!(
                "non-upsert statement kind {kind:?} carries {} update ops",
                ops.len()
            )));
        }

        Ok((
            Statement {
                kind,
                lsn,
                tuple,
                ops,
            },
            offset,
        ))
    }
}
