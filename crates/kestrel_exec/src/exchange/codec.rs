//! Bit-exact conversion between in-memory batches and their wire form.
//!
//! Fixed-width columns ship as little-endian value concatenation;
//! byte-slice columns ship data and offsets verbatim; validity masks pack
//! to an LSB-first bitmap (1 = valid, empty = all valid). Decode
//! reconstitutes vectors by the wire type discriminant and never
//! re-encodes values.

use std::collections::HashMap;

use uuid::Uuid;

use kestrel_common::error::{EngineError, ExecError, ExecResult};

use crate::batch::Batch;
use crate::column::{Col, ColumnType, PhysicalClass, Vector};
use crate::proto;

pub fn pack_validity(mask: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; mask.len().div_ceil(8)];
    for (i, valid) in mask.iter().enumerate() {
        if *valid {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

pub fn unpack_validity(bytes: &[u8], len: usize) -> ExecResult<Vec<bool>> {
    if bytes.len() < len.div_ceil(8) {
        return Err(EngineError::Codec(format!(
            "validity bitmap has {} bytes, need {} for {len} rows",
            bytes.len(),
            len.div_ceil(8)
        )));
    }
    Ok((0..len).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect())
}

fn i64s_to_le(values: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn f64s_to_le(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn le_to_i64s(bytes: &[u8], len: usize) -> ExecResult<Vec<i64>> {
    if bytes.len() != len * 8 {
        return Err(EngineError::Codec(format!(
            "int64 column has {} value bytes, expected {}",
            bytes.len(),
            len * 8
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn le_to_f64s(bytes: &[u8], len: usize) -> ExecResult<Vec<f64>> {
    if bytes.len() != len * 8 {
        return Err(EngineError::Codec(format!(
            "float64 column has {} value bytes, expected {}",
            bytes.len(),
            len * 8
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn le_to_u64s(bytes: &[u8], count: usize) -> ExecResult<Vec<u64>> {
    if bytes.len() != count * 8 {
        return Err(EngineError::Codec(format!(
            "offsets have {} bytes, expected {}",
            bytes.len(),
            count * 8
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn encode_col(name: &str, col: &Col) -> proto::Column {
    let validity = col
        .vector
        .validity()
        .map(pack_validity)
        .unwrap_or_default();
    let (values, offsets) = match &col.vector {
        Vector::Int64s { values, .. } => (i64s_to_le(values), Vec::new()),
        Vector::Float64s { values, .. } => (f64s_to_le(values), Vec::new()),
        Vector::Bytes { data, offsets, .. } => {
            let mut off = Vec::with_capacity(offsets.len() * 8);
            for o in offsets {
                off.extend_from_slice(&o.to_le_bytes());
            }
            (data.clone(), off)
        }
    };
    proto::Column {
        name: name.to_string(),
        group: col.group,
        order: col.order,
        col_type: col.col_type.wire_tag(),
        values,
        validity,
        offsets,
    }
}

fn decode_col(col: proto::Column, len: usize) -> ExecResult<(String, Col)> {
    let col_type = ColumnType::from_wire_tag(col.col_type)?;
    let validity = if col.validity.is_empty() {
        None
    } else {
        Some(unpack_validity(&col.validity, len)?)
    };
    let vector = match col_type.physical() {
        PhysicalClass::Int64 => Vector::Int64s {
            values: le_to_i64s(&col.values, len)?,
            validity,
        },
        PhysicalClass::Float64 => Vector::Float64s {
            values: le_to_f64s(&col.values, len)?,
            validity,
        },
        PhysicalClass::Bytes => {
            let offsets = le_to_u64s(&col.offsets, len + 1)?;
            let data_len = col.values.len() as u64;
            if offsets.first().copied() != Some(0) || offsets.last().copied() != Some(data_len) {
                return Err(EngineError::Codec(format!(
                    "byte column {} has inconsistent offsets",
                    col.name
                )));
            }
            Vector::Bytes {
                data: col.values,
                offsets,
                validity,
            }
        }
    };
    Ok((
        col.name,
        Col {
            group: col.group,
            order: col.order,
            col_type,
            vector,
        },
    ))
}

pub fn encode_batch(batch: &Batch) -> proto::VectorBatch {
    proto::VectorBatch {
        len: batch.len() as i64,
        columns: batch
            .columns()
            .iter()
            .map(|(name, col)| encode_col(name, col))
            .collect(),
    }
}

pub fn decode_batch(wire: proto::VectorBatch) -> ExecResult<Batch> {
    let len = usize::try_from(wire.len)
        .map_err(|_| EngineError::Codec(format!("negative batch length {}", wire.len)))?;
    let mut columns = HashMap::with_capacity(wire.columns.len());
    for col in wire.columns {
        let (name, col) = decode_col(col, len)?;
        columns.insert(name, col);
    }
    let batch = Batch::try_new(columns)?;
    if batch.len() != len {
        return Err(EngineError::Codec(format!(
            "batch header says {len} rows, columns carry {}",
            batch.len()
        )));
    }
    Ok(batch)
}

pub fn encode_error(err: &ExecError) -> proto::ExecErrorMsg {
    proto::ExecErrorMsg {
        id: err.id.as_bytes().to_vec(),
        detail: err.detail.clone(),
        node_name: err.node_name.clone(),
        stack: err.stack.clone(),
    }
}

pub fn decode_error(wire: proto::ExecErrorMsg) -> ExecError {
    ExecError {
        id: Uuid::from_slice(&wire.id).unwrap_or_else(|_| Uuid::nil()),
        detail: wire.detail,
        node_name: wire.node_name,
        stack: wire.stack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(batch: &Batch) -> Batch {
        decode_batch(encode_batch(batch)).unwrap()
    }

    fn batch_of(cols: Vec<(&str, Col)>) -> Batch {
        Batch::try_new(cols.into_iter().map(|(n, c)| (n.to_string(), c)).collect()).unwrap()
    }

    #[test]
    fn test_int64_round_trip() {
        let batch = batch_of(vec![(
            "v",
            Col::new(0, 0, ColumnType::Int64, Vector::from_i64s(vec![-1, 0, i64::MAX])),
        )]);
        let back = round_trip(&batch);
        let col = back.column("v").unwrap();
        assert_eq!(col.col_type, ColumnType::Int64);
        assert_eq!(col.vector.i64_at(0), Some(-1));
        assert_eq!(col.vector.i64_at(2), Some(i64::MAX));
    }

    #[test]
    fn test_all_logical_types_round_trip() {
        let batch = batch_of(vec![
            (
                "b",
                Col::new(0, 0, ColumnType::Bool, Vector::from_i64s(vec![1, 0])),
            ),
            (
                "i32",
                Col::new(0, 1, ColumnType::Int32, Vector::from_i64s(vec![7, -7])),
            ),
            (
                "ts",
                Col::new(0, 2, ColumnType::Timestamp, Vector::from_i64s(vec![100, 200])),
            ),
            (
                "dt",
                Col::new(0, 3, ColumnType::Datetime, Vector::from_i64s(vec![5, 6])),
            ),
            (
                "f",
                Col::new(0, 4, ColumnType::Float64, Vector::from_f64s(vec![1.25, -0.5])),
            ),
            (
                "s",
                Col::new(0, 5, ColumnType::String, Vector::from_strings(&["a", "bc"])),
            ),
        ]);
        let back = round_trip(&batch);
        assert_eq!(back.len(), 2);
        assert_eq!(back.column("b").unwrap().col_type, ColumnType::Bool);
        assert_eq!(back.column("i32").unwrap().col_type, ColumnType::Int32);
        assert_eq!(back.column("ts").unwrap().vector.i64_at(1), Some(200));
        assert_eq!(back.column("f").unwrap().vector.f64_at(0), Some(1.25));
        assert_eq!(
            back.column("s").unwrap().vector.bytes_at(1),
            Some(&b"bc"[..])
        );
    }

    #[test]
    fn test_validity_round_trip() {
        let batch = batch_of(vec![(
            "v",
            Col::new(
                0,
                0,
                ColumnType::Int64,
                Vector::Int64s {
                    values: vec![1, 2, 3, 4, 5, 6, 7, 8, 9],
                    validity: Some(vec![
                        true, false, true, true, false, true, true, true, false,
                    ]),
                },
            ),
        )]);
        let back = round_trip(&batch);
        let v = &back.column("v").unwrap().vector;
        assert_eq!(v.i64_at(0), Some(1));
        assert_eq!(v.i64_at(1), None);
        assert_eq!(v.i64_at(8), None);
        assert_eq!(v.i64_at(7), Some(8));
    }

    #[test]
    fn test_all_valid_ships_empty_bitmap() {
        let batch = batch_of(vec![(
            "v",
            Col::new(0, 0, ColumnType::Int64, Vector::from_i64s(vec![1, 2])),
        )]);
        let wire = encode_batch(&batch);
        assert!(wire.columns[0].validity.is_empty());
        let back = decode_batch(wire).unwrap();
        assert!(back.column("v").unwrap().vector.validity().is_none());
    }

    #[test]
    fn test_group_order_preserved() {
        let batch = batch_of(vec![(
            "v",
            Col::new(3, 9, ColumnType::Int64, Vector::from_i64s(vec![1])),
        )]);
        let back = round_trip(&batch);
        let col = back.column("v").unwrap();
        assert_eq!(col.group, 3);
        assert_eq!(col.order, 9);
    }

    #[test]
    fn test_truncated_values_rejected() {
        let batch = batch_of(vec![(
            "v",
            Col::new(0, 0, ColumnType::Int64, Vector::from_i64s(vec![1, 2])),
        )]);
        let mut wire = encode_batch(&batch);
        wire.columns[0].values.pop();
        assert!(matches!(
            decode_batch(wire).unwrap_err(),
            EngineError::Codec(_)
        ));
    }

    #[test]
    fn test_bad_offsets_rejected() {
        let batch = batch_of(vec![(
            "s",
            Col::new(0, 0, ColumnType::String, Vector::from_strings(&["ab"])),
        )]);
        let mut wire = encode_batch(&batch);
        let last = wire.columns[0].offsets.len() - 8;
        wire.columns[0].offsets[last] ^= 0xff;
        assert!(matches!(
            decode_batch(wire).unwrap_err(),
            EngineError::Codec(_)
        ));
    }

    #[test]
    fn test_unknown_type_tag_rejected() {
        let batch = batch_of(vec![(
            "v",
            Col::new(0, 0, ColumnType::Int64, Vector::from_i64s(vec![1])),
        )]);
        let mut wire = encode_batch(&batch);
        wire.columns[0].col_type = 42;
        assert!(decode_batch(wire).is_err());
    }

    #[test]
    fn test_exec_error_round_trip() {
        let err = ExecError::new("merge failed", "node-a");
        let back = decode_error(encode_error(&err));
        assert_eq!(back, err);
    }

    #[test]
    fn test_pack_unpack_validity() {
        let mask = vec![true, false, false, true, true, false, true, true, true];
        let packed = pack_validity(&mask);
        assert_eq!(packed.len(), 2);
        assert_eq!(unpack_validity(&packed, mask.len()).unwrap(), mask);
    }
}
