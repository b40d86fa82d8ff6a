//! Column batch: the unit of data flow between operators.

use std::collections::HashMap;

use kestrel_common::error::{EngineError, ExecResult};

use crate::column::Col;

/// A set of equal-length named columns.
///
/// Invariant: every column's vector length equals `len`. Construction
/// rejects violations; nothing downstream re-checks.
///
/// The zero-length batch is the end-of-stream sentinel. `next()` on an
/// operator returns it exactly once; callers must not pull again after
/// seeing it.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    len: usize,
    columns: HashMap<String, Col>,
}

impl Batch {
    /// Build a batch, validating the length invariant.
    pub fn try_new(columns: HashMap<String, Col>) -> ExecResult<Self> {
        let mut iter = columns.iter();
        let len = match iter.next() {
            Some((_, col)) => col.len(),
            None => 0,
        };
        for (name, col) in iter {
            if col.len() != len {
                return Err(EngineError::Invariant(format!(
                    "column {name} has {} rows, batch has {len}",
                    col.len()
                )));
            }
        }
        Ok(Self { len, columns })
    }

    /// The end-of-stream sentinel.
    pub fn end_of_stream() -> Self {
        Self::default()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn columns(&self) -> &HashMap<String, Col> {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Col> {
        self.columns.get(name)
    }

    /// Column names with their `(group, order)` positions, sorted by
    /// position then name. This is the serialized output order.
    pub fn ordered_names(&self) -> Vec<&str> {
        let mut names: Vec<(&str, i64, i64)> = self
            .columns
            .iter()
            .map(|(name, col)| (name.as_str(), col.group, col.order))
            .collect();
        names.sort_by(|a, b| (a.1, a.2, a.0).cmp(&(b.1, b.2, b.0)));
        names.into_iter().map(|(name, _, _)| name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnType, Vector};

    fn int_col(order: i64, values: Vec<i64>) -> Col {
        Col::new(0, order, ColumnType::Int64, Vector::from_i64s(values))
    }

    #[test]
    fn test_length_invariant_enforced() {
        let mut cols = HashMap::new();
        cols.insert("a".to_string(), int_col(0, vec![1, 2, 3]));
        cols.insert("b".to_string(), int_col(1, vec![1, 2]));
        let err = Batch::try_new(cols).unwrap_err();
        assert!(err.is_internal_bug());
    }

    #[test]
    fn test_equal_lengths_accepted() {
        let mut cols = HashMap::new();
        cols.insert("a".to_string(), int_col(0, vec![1, 2]));
        cols.insert("b".to_string(), int_col(1, vec![3, 4]));
        let batch = Batch::try_new(cols).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_end_of_stream());
    }

    #[test]
    fn test_end_of_stream_sentinel() {
        let batch = Batch::end_of_stream();
        assert!(batch.is_end_of_stream());
        assert_eq!(batch.len(), 0);
        assert!(batch.columns().is_empty());
    }

    #[test]
    fn test_ordered_names_follow_group_then_order() {
        let mut cols = HashMap::new();
        cols.insert("b".to_string(), int_col(1, vec![1]));
        cols.insert("a".to_string(), int_col(0, vec![1]));
        cols.insert(
            "c".to_string(),
            Col::new(1, 0, ColumnType::Int64, Vector::from_i64s(vec![1])),
        );
        let batch = Batch::try_new(cols).unwrap();
        assert_eq!(batch.ordered_names(), vec!["a", "b", "c"]);
    }
}
