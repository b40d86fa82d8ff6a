//! K-way merge-sort over pre-sorted batch streams.
//!
//! Each input must already be sorted ascending by the key column. The
//! merge guarantees global non-decreasing key order across all inputs
//! combined; it is the only ordering guarantee the engine makes.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use kestrel_common::error::{EngineError, ExecResult};

use crate::batch::Batch;
use crate::column::{Col, ColumnType, VectorBuilder};
use crate::context::QueryContext;
use crate::operator::BatchOperator;

/// Min-heap entry: smallest key wins, ties broken by input index so the
/// merge is deterministic.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    key: i64,
    input: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputState {
    /// Has an unconsumed row; present in the heap.
    Active,
    /// First pull returned the empty sentinel. Re-probed exactly once
    /// when the heap drains; absence of data must not end the merge.
    NoData,
    Done,
}

struct MergeInput {
    op: Box<dyn BatchOperator>,
    batch: Batch,
    row: usize,
    state: InputState,
}

struct OutCol {
    group: i64,
    order: i64,
    col_type: ColumnType,
    builder: VectorBuilder,
}

/// Output batch under construction. The column set is the union of the
/// inputs' columns; a name first seen mid-batch is backfilled with nulls
/// for the rows already emitted.
struct OutputBatch {
    target: usize,
    rows: usize,
    cols: HashMap<String, OutCol>,
}

impl OutputBatch {
    fn new(target: usize) -> Self {
        Self {
            target,
            rows: 0,
            cols: HashMap::new(),
        }
    }

    fn copy_row(&mut self, batch: &Batch, row: usize) -> ExecResult<()> {
        for (name, col) in batch.columns() {
            if !self.cols.contains_key(name) {
                let mut builder = VectorBuilder::for_type(col.col_type, self.target);
                for _ in 0..self.rows {
                    builder.push_null();
                }
                self.cols.insert(
                    name.clone(),
                    OutCol {
                        group: col.group,
                        order: col.order,
                        col_type: col.col_type,
                        builder,
                    },
                );
            }
        }
        for (name, out) in self.cols.iter_mut() {
            match batch.column(name) {
                Some(col) => out.builder.push_from(&col.vector, row)?,
                None => out.builder.push_null(),
            }
        }
        self.rows += 1;
        Ok(())
    }

    fn finish(self) -> ExecResult<Batch> {
        let cols = self
            .cols
            .into_iter()
            .map(|(name, out)| {
                (
                    name,
                    Col::new(out.group, out.order, out.col_type, out.builder.finish()),
                )
            })
            .collect();
        Batch::try_new(cols)
    }
}

/// Merges *k* individually key-sorted batch streams into one.
///
/// The key column name and the output row target are explicit
/// constructor parameters; plans conventionally merge on `ts` but the
/// operator has no built-in column name. The key must be present and
/// non-null in every input batch.
pub struct MergeOp {
    ctx: Arc<QueryContext>,
    key_column: String,
    target_rows: usize,
    inputs: Vec<MergeInput>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    started: bool,
    exhausted: bool,
    initialized: bool,
    label: String,
}

impl MergeOp {
    pub fn new(
        ctx: Arc<QueryContext>,
        inputs: Vec<Box<dyn BatchOperator>>,
        key_column: impl Into<String>,
        target_rows: usize,
    ) -> Self {
        let key_column = key_column.into();
        let label = format!("merge:{key_column}/{}", inputs.len());
        Self {
            ctx,
            key_column,
            target_rows: target_rows.max(1),
            inputs: inputs
                .into_iter()
                .map(|op| MergeInput {
                    op,
                    batch: Batch::end_of_stream(),
                    row: 0,
                    state: InputState::NoData,
                })
                .collect(),
            heap: BinaryHeap::new(),
            started: false,
            exhausted: false,
            initialized: false,
            label,
        }
    }

    fn key_at(&self, input: usize) -> ExecResult<i64> {
        let inp = &self.inputs[input];
        let col = inp.batch.column(&self.key_column).ok_or_else(|| {
            EngineError::Invariant(format!(
                "{}: input {input} batch lacks key column {}",
                self.label, self.key_column
            ))
        })?;
        col.vector.i64_at(inp.row).ok_or_else(|| {
            EngineError::Invariant(format!(
                "{}: input {input} key column {} is null or not int64 at row {}",
                self.label, self.key_column, inp.row
            ))
        })
    }

    /// Pull the first batch of every input and seed the heap. Inputs
    /// whose first batch is empty are parked as `NoData`.
    async fn start(&mut self) -> ExecResult<()> {
        for idx in 0..self.inputs.len() {
            let batch = self.inputs[idx].op.next().await?;
            if batch.is_end_of_stream() {
                self.inputs[idx].state = InputState::NoData;
                continue;
            }
            self.inputs[idx].batch = batch;
            self.inputs[idx].row = 0;
            self.inputs[idx].state = InputState::Active;
            let key = self.key_at(idx)?;
            self.heap.push(Reverse(HeapEntry { key, input: idx }));
        }
        self.started = true;
        tracing::debug!(
            merge = %self.label,
            active = self.heap.len(),
            "merge started"
        );
        Ok(())
    }

    /// Advance input `idx` past its current row, pulling its next batch
    /// when the current one is consumed, and re-enter it in the heap if
    /// rows remain.
    async fn advance(&mut self, idx: usize) -> ExecResult<()> {
        let inp = &mut self.inputs[idx];
        inp.row += 1;
        if inp.row >= inp.batch.len() {
            let next = inp.op.next().await?;
            if next.is_end_of_stream() {
                inp.state = InputState::Done;
                inp.batch = Batch::end_of_stream();
                return Ok(());
            }
            inp.batch = next;
            inp.row = 0;
        }
        let key = self.key_at(idx)?;
        self.heap.push(Reverse(HeapEntry { key, input: idx }));
        Ok(())
    }

    /// One probe of every `NoData` input after the heap drains. Returns
    /// true if any input contributed new rows.
    async fn reprobe(&mut self) -> ExecResult<bool> {
        let mut revived = false;
        for idx in 0..self.inputs.len() {
            if self.inputs[idx].state != InputState::NoData {
                continue;
            }
            let batch = self.inputs[idx].op.next().await?;
            if batch.is_end_of_stream() {
                self.inputs[idx].state = InputState::Done;
                continue;
            }
            self.inputs[idx].batch = batch;
            self.inputs[idx].row = 0;
            self.inputs[idx].state = InputState::Active;
            let key = self.key_at(idx)?;
            self.heap.push(Reverse(HeapEntry { key, input: idx }));
            revived = true;
        }
        Ok(revived)
    }
}

#[async_trait]
impl BatchOperator for MergeOp {
    async fn init(&mut self) -> ExecResult<()> {
        if self.initialized {
            return Ok(());
        }
        for inp in &mut self.inputs {
            inp.op.init().await?;
        }
        self.initialized = true;
        Ok(())
    }

    async fn next(&mut self) -> ExecResult<Batch> {
        self.ctx.check()?;
        if self.exhausted {
            return Ok(Batch::end_of_stream());
        }
        if !self.started {
            self.start().await?;
        }

        let mut out = OutputBatch::new(self.target_rows);
        while out.rows < self.target_rows {
            let Some(Reverse(entry)) = self.heap.pop() else {
                if self.reprobe().await? {
                    continue;
                }
                break;
            };
            let inp = &self.inputs[entry.input];
            out.copy_row(&inp.batch, inp.row)?;
            self.advance(entry.input).await?;
        }

        if out.rows == 0 {
            self.exhausted = true;
            return Ok(Batch::end_of_stream());
        }
        out.finish()
    }

    async fn close(&mut self) {
        for inp in &mut self.inputs {
            inp.op.close().await;
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Vector;
    use kestrel_common::types::QueryId;
    use std::collections::VecDeque;

    fn ctx() -> Arc<QueryContext> {
        Arc::new(QueryContext::new(QueryId::new(), "node-test"))
    }

    /// Test input replaying a fixed batch sequence, then the sentinel.
    struct StagedOp {
        batches: VecDeque<Batch>,
    }

    #[async_trait]
    impl BatchOperator for StagedOp {
        async fn init(&mut self) -> ExecResult<()> {
            Ok(())
        }

        async fn next(&mut self) -> ExecResult<Batch> {
            Ok(self.batches.pop_front().unwrap_or_else(Batch::end_of_stream))
        }

        async fn close(&mut self) {}

        fn name(&self) -> &str {
            "staged"
        }
    }

    fn ts_batch(values: &[i64]) -> Batch {
        let mut cols = HashMap::new();
        cols.insert(
            "ts".to_string(),
            Col::new(0, 0, ColumnType::Timestamp, Vector::from_i64s(values.to_vec())),
        );
        Batch::try_new(cols).unwrap()
    }

    fn ts_source(values: &[i64], chunk: usize) -> Box<dyn BatchOperator> {
        let batches = values
            .chunks(chunk.max(1))
            .map(ts_batch)
            .collect::<VecDeque<_>>();
        Box::new(StagedOp { batches })
    }

    async fn drain_ts(op: &mut MergeOp) -> Vec<i64> {
        let mut out = Vec::new();
        loop {
            let batch = op.next().await.unwrap();
            if batch.is_end_of_stream() {
                return out;
            }
            let col = batch.column("ts").unwrap();
            for i in 0..batch.len() {
                out.push(col.vector.i64_at(i).unwrap());
            }
        }
    }

    #[tokio::test]
    async fn test_three_way_merge_is_globally_sorted() {
        for chunk in [1, 3, 8] {
            let evens: Vec<i64> = (0..8).map(|i| i * 2).collect();
            let odds: Vec<i64> = (0..8).map(|i| i * 2 + 1).collect();
            let high: Vec<i64> = (0..8).map(|i| 150 + i * 50).collect();
            let mut merge = MergeOp::new(
                ctx(),
                vec![
                    ts_source(&evens, chunk),
                    ts_source(&odds, chunk),
                    ts_source(&high, chunk),
                ],
                "ts",
                5,
            );
            merge.init().await.unwrap();
            let got = drain_ts(&mut merge).await;
            let mut want: Vec<i64> = (0..16).collect();
            want.extend((0..8).map(|i| 150 + i * 50));
            assert_eq!(got, want, "chunk size {chunk}");
            merge.close().await;
        }
    }

    #[tokio::test]
    async fn test_output_batches_respect_row_target() {
        let mut merge = MergeOp::new(
            ctx(),
            vec![ts_source(&(0..10).collect::<Vec<_>>(), 4)],
            "ts",
            3,
        );
        merge.init().await.unwrap();
        let mut sizes = Vec::new();
        loop {
            let b = merge.next().await.unwrap();
            if b.is_end_of_stream() {
                break;
            }
            sizes.push(b.len());
        }
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[tokio::test]
    async fn test_equal_keys_break_ties_by_input_index() {
        let mut cols_a = HashMap::new();
        cols_a.insert(
            "ts".to_string(),
            Col::new(0, 0, ColumnType::Timestamp, Vector::from_i64s(vec![5, 5])),
        );
        cols_a.insert(
            "src".to_string(),
            Col::new(0, 1, ColumnType::String, Vector::from_strings(&["a", "a"])),
        );
        let mut cols_b = HashMap::new();
        cols_b.insert(
            "ts".to_string(),
            Col::new(0, 0, ColumnType::Timestamp, Vector::from_i64s(vec![5])),
        );
        cols_b.insert(
            "src".to_string(),
            Col::new(0, 1, ColumnType::String, Vector::from_strings(&["b"])),
        );
        let a = Box::new(StagedOp {
            batches: VecDeque::from([Batch::try_new(cols_a).unwrap()]),
        });
        let b = Box::new(StagedOp {
            batches: VecDeque::from([Batch::try_new(cols_b).unwrap()]),
        });
        let mut merge = MergeOp::new(ctx(), vec![a, b], "ts", 16);
        merge.init().await.unwrap();
        let batch = merge.next().await.unwrap();
        let src = batch.column("src").unwrap();
        // Input 0's rows drain before input 1's at equal keys.
        assert_eq!(src.vector.bytes_at(0), Some(&b"a"[..]));
        assert_eq!(src.vector.bytes_at(1), Some(&b"a"[..]));
        assert_eq!(src.vector.bytes_at(2), Some(&b"b"[..]));
    }

    #[tokio::test]
    async fn test_empty_first_batch_is_reprobed_not_eos() {
        // Input 1 has nothing on the first pull but yields data on the
        // re-probe after the heap drains.
        let late = Box::new(StagedOp {
            batches: VecDeque::from([Batch::end_of_stream(), ts_batch(&[100, 200])]),
        });
        let mut merge = MergeOp::new(ctx(), vec![ts_source(&[1, 2, 3], 2), late], "ts", 16);
        merge.init().await.unwrap();
        let got = drain_ts(&mut merge).await;
        assert_eq!(got, vec![1, 2, 3, 100, 200]);
    }

    #[tokio::test]
    async fn test_all_inputs_empty_is_eos() {
        let a = Box::new(StagedOp {
            batches: VecDeque::new(),
        });
        let b = Box::new(StagedOp {
            batches: VecDeque::new(),
        });
        let mut merge = MergeOp::new(ctx(), vec![a, b], "ts", 16);
        merge.init().await.unwrap();
        assert!(merge.next().await.unwrap().is_end_of_stream());
        assert!(merge.next().await.unwrap().is_end_of_stream());
    }

    #[tokio::test]
    async fn test_absent_column_fills_nulls() {
        let mut cols_a = HashMap::new();
        cols_a.insert(
            "ts".to_string(),
            Col::new(0, 0, ColumnType::Timestamp, Vector::from_i64s(vec![1])),
        );
        cols_a.insert(
            "v".to_string(),
            Col::new(0, 1, ColumnType::Int64, Vector::from_i64s(vec![10])),
        );
        let a = Box::new(StagedOp {
            batches: VecDeque::from([Batch::try_new(cols_a).unwrap()]),
        });
        let b = Box::new(StagedOp {
            batches: VecDeque::from([ts_batch(&[2])]),
        });
        let mut merge = MergeOp::new(ctx(), vec![a, b], "ts", 16);
        merge.init().await.unwrap();
        let batch = merge.next().await.unwrap();
        assert_eq!(batch.len(), 2);
        let v = batch.column("v").unwrap();
        assert_eq!(v.vector.i64_at(0), Some(10));
        assert_eq!(v.vector.i64_at(1), None);
    }

    #[tokio::test]
    async fn test_missing_key_column_is_invariant_error() {
        let mut cols = HashMap::new();
        cols.insert(
            "other".to_string(),
            Col::new(0, 0, ColumnType::Int64, Vector::from_i64s(vec![1])),
        );
        let a = Box::new(StagedOp {
            batches: VecDeque::from([Batch::try_new(cols).unwrap()]),
        });
        let mut merge = MergeOp::new(ctx(), vec![a], "ts", 16);
        merge.init().await.unwrap();
        let err = merge.next().await.unwrap_err();
        assert!(err.is_internal_bug());
    }

    #[tokio::test]
    async fn test_canceled_context_stops_merge() {
        let c = ctx();
        let mut merge = MergeOp::new(c.clone(), vec![ts_source(&[1, 2], 1)], "ts", 16);
        merge.init().await.unwrap();
        c.cancel_quiet();
        assert!(merge.next().await.unwrap_err().is_canceled());
    }
}
