//! Leaf operators above storage: column adapters and the batch-building
//! segment scan.

use std::sync::Arc;

use async_trait::async_trait;
use std::collections::HashMap;

use kestrel_common::error::{EngineError, ExecResult};

use crate::batch::Batch;
use crate::column::{Col, ColumnType, Vector};
use crate::context::QueryContext;
use crate::operator::{BatchOperator, ColumnOperator};
use crate::segment::{Segment, SegmentColumn};

/// Thin adapter lifting a storage column reader into the operator tree.
/// Pure forwarding; no transformation.
pub struct SegmentColumnOp {
    name: String,
    reader: Box<dyn SegmentColumn>,
}

impl SegmentColumnOp {
    pub fn new(name: impl Into<String>, reader: Box<dyn SegmentColumn>) -> Self {
        Self {
            name: name.into(),
            reader,
        }
    }

    pub fn col_type(&self) -> ColumnType {
        self.reader.col_type()
    }
}

#[async_trait]
impl ColumnOperator for SegmentColumnOp {
    async fn init(&mut self) -> ExecResult<()> {
        Ok(())
    }

    async fn next(&mut self) -> ExecResult<Option<Vector>> {
        self.reader.next_chunk()
    }

    async fn close(&mut self) {}

    fn name(&self) -> &str {
        &self.name
    }
}

struct ScanColumn {
    name: String,
    col_type: ColumnType,
    op: Box<dyn ColumnOperator>,
}

/// Zips an ordered list of named column operators into batches.
///
/// Every `next` pulls exactly one vector from every child. Children must
/// exhaust in lockstep and produce equal-length vectors; anything else is
/// a broken storage invariant and fails the query rather than truncating.
pub struct SegmentScanOp {
    ctx: Arc<QueryContext>,
    label: String,
    columns: Vec<ScanColumn>,
    exhausted: bool,
    initialized: bool,
}

impl std::fmt::Debug for SegmentScanOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentScanOp")
            .field("label", &self.label)
            .field("columns", &self.columns.len())
            .field("exhausted", &self.exhausted)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl SegmentScanOp {
    pub fn new(
        ctx: Arc<QueryContext>,
        label: impl Into<String>,
        columns: Vec<(String, ColumnType, Box<dyn ColumnOperator>)>,
    ) -> Self {
        Self {
            ctx,
            label: label.into(),
            columns: columns
                .into_iter()
                .map(|(name, col_type, op)| ScanColumn { name, col_type, op })
                .collect(),
            exhausted: false,
            initialized: false,
        }
    }

    /// Scan `columns` of one leased segment. Fails if the segment lacks
    /// any requested column.
    pub fn from_segment(
        ctx: Arc<QueryContext>,
        segment: &Arc<dyn Segment>,
        columns: &[String],
    ) -> ExecResult<Self> {
        let mut children = Vec::with_capacity(columns.len());
        for name in columns {
            let reader = segment.column(name).ok_or_else(|| {
                EngineError::Storage(format!("segment {} has no column {name}", segment.id()))
            })?;
            let col_type = reader.col_type();
            children.push((
                name.clone(),
                col_type,
                Box::new(SegmentColumnOp::new(name.clone(), reader)) as Box<dyn ColumnOperator>,
            ));
        }
        Ok(Self::new(
            ctx,
            format!("scan:{}", segment.id()),
            children,
        ))
    }
}

#[async_trait]
impl BatchOperator for SegmentScanOp {
    async fn init(&mut self) -> ExecResult<()> {
        if self.initialized {
            return Ok(());
        }
        for col in &mut self.columns {
            col.op.init().await?;
        }
        self.initialized = true;
        tracing::debug!(scan = %self.label, columns = self.columns.len(), "scan initialized");
        Ok(())
    }

    async fn next(&mut self) -> ExecResult<Batch> {
        self.ctx.check()?;
        if self.exhausted {
            return Ok(Batch::end_of_stream());
        }

        let mut pulled: Vec<Option<Vector>> = Vec::with_capacity(self.columns.len());
        for col in &mut self.columns {
            pulled.push(col.op.next().await?);
        }

        let exhausted_count = pulled.iter().filter(|v| v.is_none()).count();
        if exhausted_count == pulled.len() {
            self.exhausted = true;
            return Ok(Batch::end_of_stream());
        }
        if exhausted_count > 0 {
            return Err(EngineError::Invariant(format!(
                "{}: {exhausted_count} of {} columns exhausted early",
                self.label,
                pulled.len()
            )));
        }

        let mut cols = HashMap::with_capacity(self.columns.len());
        let mut len: Option<usize> = None;
        for (idx, (col, vector)) in self.columns.iter().zip(pulled).enumerate() {
            let Some(vector) = vector else {
                continue;
            };
            match len {
                None => len = Some(vector.len()),
                Some(expected) if vector.len() != expected => {
                    return Err(EngineError::Invariant(format!(
                        "{}: column {} produced {} rows, expected {expected}",
                        self.label,
                        col.name,
                        vector.len()
                    )));
                }
                _ => {}
            }
            cols.insert(
                col.name.clone(),
                Col::new(0, idx as i64, col.col_type, vector),
            );
        }
        Batch::try_new(cols)
    }

    async fn close(&mut self) {
        for col in &mut self.columns {
            col.op.close().await;
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}
