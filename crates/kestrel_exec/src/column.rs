//! Columnar value model.
//!
//! A `Vector` is typed physical storage (like a mini Arrow array); a `Col`
//! wraps one with its logical type and output position; `Batch` (see
//! `batch.rs`) is a set of equal-length named columns.
//!
//! Seven logical types share three physical layouts. All integer-like
//! types (bool, int32, int64, timestamp, datetime) are stored and shipped
//! as i64 values with the logical tag preserved, so copy dispatch and the
//! wire format only ever deal with the three layouts.

use serde::{Deserialize, Serialize};
use std::fmt;

use kestrel_common::error::{EngineError, ExecResult};

// ---------------------------------------------------------------------------
// ColumnType
// ---------------------------------------------------------------------------

/// Logical column type. The wire discriminant is stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int32,
    Int64,
    Float64,
    String,
    Timestamp,
    Datetime,
}

/// Physical storage class backing a logical type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalClass {
    Int64,
    Float64,
    Bytes,
}

impl ColumnType {
    /// Stable wire discriminant.
    pub fn wire_tag(&self) -> i32 {
        match self {
            ColumnType::Bool => 1,
            ColumnType::Int32 => 2,
            ColumnType::Int64 => 3,
            ColumnType::Float64 => 4,
            ColumnType::String => 5,
            ColumnType::Timestamp => 6,
            ColumnType::Datetime => 7,
        }
    }

    pub fn from_wire_tag(tag: i32) -> ExecResult<Self> {
        match tag {
            1 => Ok(ColumnType::Bool),
            2 => Ok(ColumnType::Int32),
            3 => Ok(ColumnType::Int64),
            4 => Ok(ColumnType::Float64),
            5 => Ok(ColumnType::String),
            6 => Ok(ColumnType::Timestamp),
            7 => Ok(ColumnType::Datetime),
            other => Err(EngineError::Invariant(format!(
                "unknown column type discriminant {other}"
            ))),
        }
    }

    pub fn physical(&self) -> PhysicalClass {
        match self {
            ColumnType::Bool
            | ColumnType::Int32
            | ColumnType::Int64
            | ColumnType::Timestamp
            | ColumnType::Datetime => PhysicalClass::Int64,
            ColumnType::Float64 => PhysicalClass::Float64,
            ColumnType::String => PhysicalClass::Bytes,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Bool => "bool",
            ColumnType::Int32 => "int32",
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::String => "string",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Datetime => "datetime",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Vector
// ---------------------------------------------------------------------------

/// Typed physical column storage with an optional validity mask.
///
/// `validity[i] == true` means value *i* is present; `None` means all
/// values are valid.
#[derive(Debug, Clone, PartialEq)]
pub enum Vector {
    Int64s {
        values: Vec<i64>,
        validity: Option<Vec<bool>>,
    },
    Float64s {
        values: Vec<f64>,
        validity: Option<Vec<bool>>,
    },
    /// Variable-width values. `offsets` has `len + 1` entries; value *i*
    /// is `data[offsets[i]..offsets[i+1]]`.
    Bytes {
        data: Vec<u8>,
        offsets: Vec<u64>,
        validity: Option<Vec<bool>>,
    },
}

impl Vector {
    /// Number of logical rows.
    pub fn len(&self) -> usize {
        match self {
            Vector::Int64s { values, .. } => values.len(),
            Vector::Float64s { values, .. } => values.len(),
            Vector::Bytes { offsets, .. } => offsets.len().saturating_sub(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validity(&self) -> Option<&[bool]> {
        match self {
            Vector::Int64s { validity, .. }
            | Vector::Float64s { validity, .. }
            | Vector::Bytes { validity, .. } => validity.as_deref(),
        }
    }

    /// Whether value `idx` is present.
    pub fn is_valid(&self, idx: usize) -> bool {
        match self.validity() {
            Some(mask) => mask.get(idx).copied().unwrap_or(false),
            None => idx < self.len(),
        }
    }

    /// i64 value at `idx`. `None` if null, out of range, or a non-int64
    /// layout.
    pub fn i64_at(&self, idx: usize) -> Option<i64> {
        match self {
            Vector::Int64s { values, .. } if self.is_valid(idx) => values.get(idx).copied(),
            _ => None,
        }
    }

    pub fn f64_at(&self, idx: usize) -> Option<f64> {
        match self {
            Vector::Float64s { values, .. } if self.is_valid(idx) => values.get(idx).copied(),
            _ => None,
        }
    }

    pub fn bytes_at(&self, idx: usize) -> Option<&[u8]> {
        match self {
            Vector::Bytes { data, offsets, .. } if self.is_valid(idx) => {
                let start = *offsets.get(idx)? as usize;
                let end = *offsets.get(idx + 1)? as usize;
                data.get(start..end)
            }
            _ => None,
        }
    }

    /// All-valid i64 vector.
    pub fn from_i64s(values: Vec<i64>) -> Self {
        Vector::Int64s {
            values,
            validity: None,
        }
    }

    /// All-valid f64 vector.
    pub fn from_f64s(values: Vec<f64>) -> Self {
        Vector::Float64s {
            values,
            validity: None,
        }
    }

    /// All-valid byte-slice vector from owned strings.
    pub fn from_strings<S: AsRef<str>>(values: &[S]) -> Self {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(values.len() + 1);
        offsets.push(0u64);
        for v in values {
            data.extend_from_slice(v.as_ref().as_bytes());
            offsets.push(data.len() as u64);
        }
        Vector::Bytes {
            data,
            offsets,
            validity: None,
        }
    }
}

// ---------------------------------------------------------------------------
// VectorBuilder
// ---------------------------------------------------------------------------

/// Row-at-a-time builder used by the merge to assemble output vectors.
#[derive(Debug)]
pub enum VectorBuilder {
    Int64s {
        values: Vec<i64>,
        validity: Vec<bool>,
    },
    Float64s {
        values: Vec<f64>,
        validity: Vec<bool>,
    },
    Bytes {
        data: Vec<u8>,
        offsets: Vec<u64>,
        validity: Vec<bool>,
    },
}

impl VectorBuilder {
    pub fn for_type(col_type: ColumnType, capacity: usize) -> Self {
        match col_type.physical() {
            PhysicalClass::Int64 => VectorBuilder::Int64s {
                values: Vec::with_capacity(capacity),
                validity: Vec::with_capacity(capacity),
            },
            PhysicalClass::Float64 => VectorBuilder::Float64s {
                values: Vec::with_capacity(capacity),
                validity: Vec::with_capacity(capacity),
            },
            PhysicalClass::Bytes => VectorBuilder::Bytes {
                data: Vec::new(),
                offsets: vec![0],
                validity: Vec::with_capacity(capacity),
            },
        }
    }

    /// Append an invalid (null) slot.
    pub fn push_null(&mut self) {
        match self {
            VectorBuilder::Int64s { values, validity } => {
                values.push(0);
                validity.push(false);
            }
            VectorBuilder::Float64s { values, validity } => {
                values.push(0.0);
                validity.push(false);
            }
            VectorBuilder::Bytes {
                data,
                offsets,
                validity,
            } => {
                offsets.push(data.len() as u64);
                validity.push(false);
            }
        }
    }

    /// Copy row `idx` of `src`. Layout mismatch is a broken invariant.
    pub fn push_from(&mut self, src: &Vector, idx: usize) -> ExecResult<()> {
        match (&mut *self, src) {
            (VectorBuilder::Int64s { values, validity }, Vector::Int64s { .. }) => {
                match src.i64_at(idx) {
                    Some(v) => {
                        values.push(v);
                        validity.push(true);
                    }
                    None => {
                        values.push(0);
                        validity.push(false);
                    }
                }
                Ok(())
            }
            (VectorBuilder::Float64s { values, validity }, Vector::Float64s { .. }) => {
                match src.f64_at(idx) {
                    Some(v) => {
                        values.push(v);
                        validity.push(true);
                    }
                    None => {
                        values.push(0.0);
                        validity.push(false);
                    }
                }
                Ok(())
            }
            (
                VectorBuilder::Bytes {
                    data,
                    offsets,
                    validity,
                },
                Vector::Bytes { .. },
            ) => {
                match src.bytes_at(idx) {
                    Some(v) => {
                        data.extend_from_slice(v);
                        offsets.push(data.len() as u64);
                        validity.push(true);
                    }
                    None => {
                        offsets.push(data.len() as u64);
                        validity.push(false);
                    }
                }
                Ok(())
            }
            _ => Err(EngineError::Invariant(
                "vector layout mismatch while copying row".into(),
            )),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VectorBuilder::Int64s { values, .. } => values.len(),
            VectorBuilder::Float64s { values, .. } => values.len(),
            VectorBuilder::Bytes { validity, .. } => validity.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(self) -> Vector {
        // Drop the mask when every slot is valid.
        fn compact(mask: Vec<bool>) -> Option<Vec<bool>> {
            if mask.iter().all(|v| *v) {
                None
            } else {
                Some(mask)
            }
        }
        match self {
            VectorBuilder::Int64s { values, validity } => Vector::Int64s {
                values,
                validity: compact(validity),
            },
            VectorBuilder::Float64s { values, validity } => Vector::Float64s {
                values,
                validity: compact(validity),
            },
            VectorBuilder::Bytes {
                data,
                offsets,
                validity,
            } => Vector::Bytes {
                data,
                offsets,
                validity: compact(validity),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Col
// ---------------------------------------------------------------------------

/// A named batch column: logical type, output position and storage.
///
/// `(group, order)` determine the column's position in serialized output;
/// sources emit `group = 0` with `order` equal to the column's position in
/// the scan list.
#[derive(Debug, Clone, PartialEq)]
pub struct Col {
    pub group: i64,
    pub order: i64,
    pub col_type: ColumnType,
    pub vector: Vector,
}

impl Col {
    pub fn new(group: i64, order: i64, col_type: ColumnType, vector: Vector) -> Self {
        Self {
            group,
            order,
            col_type,
            vector,
        }
    }

    pub fn len(&self) -> usize {
        self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tag_round_trip() {
        for ct in [
            ColumnType::Bool,
            ColumnType::Int32,
            ColumnType::Int64,
            ColumnType::Float64,
            ColumnType::String,
            ColumnType::Timestamp,
            ColumnType::Datetime,
        ] {
            assert_eq!(ColumnType::from_wire_tag(ct.wire_tag()).unwrap(), ct);
        }
        assert!(ColumnType::from_wire_tag(0).is_err());
        assert!(ColumnType::from_wire_tag(99).is_err());
    }

    #[test]
    fn test_physical_classes() {
        assert_eq!(ColumnType::Bool.physical(), PhysicalClass::Int64);
        assert_eq!(ColumnType::Timestamp.physical(), PhysicalClass::Int64);
        assert_eq!(ColumnType::Float64.physical(), PhysicalClass::Float64);
        assert_eq!(ColumnType::String.physical(), PhysicalClass::Bytes);
    }

    #[test]
    fn test_bytes_vector_addressing() {
        let v = Vector::from_strings(&["ab", "", "cde"]);
        assert_eq!(v.len(), 3);
        assert_eq!(v.bytes_at(0), Some(&b"ab"[..]));
        assert_eq!(v.bytes_at(1), Some(&b""[..]));
        assert_eq!(v.bytes_at(2), Some(&b"cde"[..]));
        assert_eq!(v.bytes_at(3), None);
    }

    #[test]
    fn test_validity_mask() {
        let v = Vector::Int64s {
            values: vec![1, 2, 3],
            validity: Some(vec![true, false, true]),
        };
        assert_eq!(v.i64_at(0), Some(1));
        assert_eq!(v.i64_at(1), None);
        assert_eq!(v.i64_at(2), Some(3));
        assert!(!v.is_valid(1));
    }

    #[test]
    fn test_builder_copies_and_nulls() {
        let src = Vector::from_i64s(vec![10, 20, 30]);
        let mut b = VectorBuilder::for_type(ColumnType::Int64, 4);
        b.push_from(&src, 2).unwrap();
        b.push_null();
        b.push_from(&src, 0).unwrap();
        let out = b.finish();
        assert_eq!(out.len(), 3);
        assert_eq!(out.i64_at(0), Some(30));
        assert_eq!(out.i64_at(1), None);
        assert_eq!(out.i64_at(2), Some(10));
    }

    #[test]
    fn test_builder_all_valid_drops_mask() {
        let src = Vector::from_f64s(vec![1.5, 2.5]);
        let mut b = VectorBuilder::for_type(ColumnType::Float64, 2);
        b.push_from(&src, 0).unwrap();
        b.push_from(&src, 1).unwrap();
        let out = b.finish();
        assert!(out.validity().is_none());
        assert_eq!(out.f64_at(1), Some(2.5));
    }

    #[test]
    fn test_builder_layout_mismatch_is_invariant_error() {
        let src = Vector::from_i64s(vec![1]);
        let mut b = VectorBuilder::for_type(ColumnType::Float64, 1);
        let err = b.push_from(&src, 0).unwrap_err();
        assert!(err.is_internal_bug());
    }

    #[test]
    fn test_builder_bytes_null_keeps_offsets_dense() {
        let src = Vector::from_strings(&["xy"]);
        let mut b = VectorBuilder::for_type(ColumnType::String, 2);
        b.push_from(&src, 0).unwrap();
        b.push_null();
        let out = b.finish();
        assert_eq!(out.len(), 2);
        assert_eq!(out.bytes_at(0), Some(&b"xy"[..]));
        assert_eq!(out.bytes_at(1), None);
    }
}
