//! Terminal output root: serializes result batches to a caller-supplied
//! sink as newline-delimited JSON.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use kestrel_common::error::{EngineError, ExecResult};

use crate::batch::Batch;
use crate::column::{Col, ColumnType};
use crate::context::QueryContext;
use crate::operator::{BatchOperator, PipelineRoot};

/// Line-oriented destination for query results.
pub trait OutputSink: Send {
    fn write_line(&mut self, line: &str) -> ExecResult<()>;

    /// Called exactly once, at end of stream.
    fn flush(&mut self) -> ExecResult<()>;
}

/// Sink over any `std::io::Write`.
pub struct WriterSink<W: Write + Send> {
    inner: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write + Send> OutputSink for WriterSink<W> {
    fn write_line(&mut self, line: &str) -> ExecResult<()> {
        self.inner.write_all(line.as_bytes())?;
        self.inner.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> ExecResult<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests and local runs. Clones share one buffer.
#[derive(Clone, Default)]
pub struct MemSink {
    state: Arc<parking_lot::Mutex<MemSinkState>>,
}

#[derive(Default)]
struct MemSinkState {
    lines: Vec<String>,
    flushes: usize,
}

impl MemSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }
}

impl OutputSink for MemSink {
    fn write_line(&mut self, line: &str) -> ExecResult<()> {
        self.state.lock().lines.push(line.to_string());
        Ok(())
    }

    fn flush(&mut self) -> ExecResult<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }
}

fn value_at(col: &Col, idx: usize) -> Value {
    if !col.vector.is_valid(idx) {
        return Value::Null;
    }
    match col.col_type {
        ColumnType::Bool => col.vector.i64_at(idx).map(|v| json!(v != 0)),
        ColumnType::Int32
        | ColumnType::Int64
        | ColumnType::Timestamp
        | ColumnType::Datetime => col.vector.i64_at(idx).map(|v| json!(v)),
        ColumnType::Float64 => col.vector.f64_at(idx).map(|v| json!(v)),
        ColumnType::String => col
            .vector
            .bytes_at(idx)
            .map(|b| json!(String::from_utf8_lossy(b))),
    }
    .unwrap_or(Value::Null)
}

/// One batch as a `column_batch` JSON envelope, columns in
/// `(group, order)` presentation order.
fn batch_to_json(batch: &Batch) -> ExecResult<String> {
    let mut columns = Vec::new();
    for name in batch.ordered_names() {
        let Some(col) = batch.column(name) else {
            continue;
        };
        let values: Vec<Value> = (0..batch.len()).map(|i| value_at(col, i)).collect();
        columns.push(json!({
            "name": name,
            "type": col.col_type.to_string(),
            "values": values,
        }));
    }
    let envelope = json!({ "type": "column_batch", "columns": columns });
    Ok(serde_json::to_string(&envelope)?)
}

/// Pipeline root that drains its child into an `OutputSink`.
pub struct OutputOp {
    ctx: Arc<QueryContext>,
    child: Box<dyn BatchOperator>,
    sink: Box<dyn OutputSink>,
    label: String,
}

impl OutputOp {
    pub fn new(
        ctx: Arc<QueryContext>,
        child: Box<dyn BatchOperator>,
        sink: Box<dyn OutputSink>,
    ) -> Self {
        Self {
            ctx,
            child,
            sink,
            label: "output".to_string(),
        }
    }

    async fn pump(&mut self) -> ExecResult<()> {
        let mut batches = 0u64;
        let mut rows = 0u64;
        loop {
            self.ctx.check()?;
            let batch = tokio::select! {
                _ = self.ctx.done() => return Err(EngineError::Canceled),
                r = self.child.next() => r?,
            };
            if batch.is_end_of_stream() {
                self.sink.flush()?;
                tracing::debug!(batches, rows, "output complete");
                return Ok(());
            }
            batches += 1;
            rows += batch.len() as u64;
            let line = batch_to_json(&batch)?;
            self.sink.write_line(&line)?;
        }
    }
}

#[async_trait]
impl PipelineRoot for OutputOp {
    async fn run(&mut self) -> ExecResult<()> {
        self.child.init().await?;
        let result = self.pump().await;
        self.child.close().await;
        result
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
    use std::collections::{HashMap, VecDeque};

    fn ctx() -> Arc<QueryContext> {
        Arc::new(QueryContext::new(QueryId::new(), "node-test"))
    }

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

    fn mixed_batch() -> Batch {
        let mut cols = HashMap::new();
        cols.insert(
            "ts".to_string(),
            Col::new(0, 0, ColumnType::Timestamp, Vector::from_i64s(vec![1, 2])),
        );
        cols.insert(
            "msg".to_string(),
            Col::new(0, 1, ColumnType::String, Vector::from_strings(&["a", "b"])),
        );
        cols.insert(
            "score".to_string(),
            Col::new(
                0,
                2,
                ColumnType::Float64,
                Vector::Float64s {
                    values: vec![0.5, 0.0],
                    validity: Some(vec![true, false]),
                },
            ),
        );
        Batch::try_new(cols).unwrap()
    }

    #[tokio::test]
    async fn test_output_writes_column_batch_lines() {
        let sink = MemSink::new();
        let child = Box::new(StagedOp {
            batches: VecDeque::from([mixed_batch()]),
        });
        let mut op = OutputOp::new(ctx(), child, Box::new(sink.clone()));
        op.run().await.unwrap();

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed["type"], "column_batch");
        let cols = parsed["columns"].as_array().unwrap();
        // Presentation order follows (group, order).
        assert_eq!(cols[0]["name"], "ts");
        assert_eq!(cols[1]["name"], "msg");
        assert_eq!(cols[2]["name"], "score");
        assert_eq!(cols[0]["type"], "timestamp");
        assert_eq!(cols[0]["values"], json!([1, 2]));
        assert_eq!(cols[1]["values"], json!(["a", "b"]));
        assert_eq!(cols[2]["values"], json!([0.5, Value::Null]));
    }

    #[tokio::test]
    async fn test_flush_fires_exactly_once() {
        let sink = MemSink::new();
        let child = Box::new(StagedOp {
            batches: VecDeque::from([mixed_batch(), mixed_batch()]),
        });
        let mut op = OutputOp::new(ctx(), child, Box::new(sink.clone()));
        op.run().await.unwrap();
        assert_eq!(sink.lines().len(), 2);
        assert_eq!(sink.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_canceled_context_aborts_output() {
        let c = ctx();
        c.cancel_quiet();
        let sink = MemSink::new();
        let child = Box::new(StagedOp {
            batches: VecDeque::from([mixed_batch()]),
        });
        let mut op = OutputOp::new(c, child, Box::new(sink.clone()));
        let err = op.run().await.unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(sink.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_writer_sink_newline_delimits() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write_line("{\"a\":1}").unwrap();
        sink.write_line("{\"b\":2}").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.inner, b"{\"a\":1}\n{\"b\":2}\n");
    }
}
