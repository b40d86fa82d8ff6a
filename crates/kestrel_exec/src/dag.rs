//! DAG builder and runner.
//!
//! `build_dag` lowers logical fragments into a physical plan in two
//! phases. Phase one translates each fragment bottom-up, recording
//! same-node producers in a local-stream map instead of building network
//! senders. Phase two rewrites every root subtree against the union map,
//! replacing each `LocalStream` placeholder with its producer. The two
//! phases are required because the `NodeOut` that feeds a local edge may
//! live in a different fragment than the `MergeSort` that consumes it;
//! the map decouples build order from wiring order.
//!
//! `Dag::run` drives one tokio task per pipeline root and owns the
//! post-run cleanup: lease release and inbound-stream purge happen
//! exactly once, on every path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use kestrel_common::config::ExecConfig;
use kestrel_common::error::{EngineError, ExecResult};
use kestrel_common::types::{NodeName, SegmentId, StreamId};

use crate::cluster::ConnRegistry;
use crate::context::QueryContext;
use crate::exchange::{ExchangeInOp, ExchangeOutOp, StreamRegistry};
use crate::merge::MergeOp;
use crate::operator::{BatchOperator, PipelineRoot};
use crate::output::{OutputOp, OutputSink};
use crate::plan::{
    resolve_local_streams, Fragment, LogicalNode, PlanNode, PlanRoot,
};
use crate::segment::{Segment, SegmentRegistry};
use crate::source::SegmentScanOp;

/// External collaborators the engine builds against.
#[derive(Clone)]
pub struct Collaborators {
    pub segments: Arc<dyn SegmentRegistry>,
    pub conns: Arc<dyn ConnRegistry>,
    pub streams: Arc<StreamRegistry>,
    pub config: ExecConfig,
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

struct Lowering<'a> {
    local: &'a NodeName,
    collab: &'a Collaborators,
    leases: Vec<SegmentId>,
    producers: HashMap<StreamId, PlanNode>,
    roots: Vec<PlanRoot>,
}

impl<'a> Lowering<'a> {
    fn new(local: &'a NodeName, collab: &'a Collaborators) -> Self {
        Self {
            local,
            collab,
            leases: Vec::new(),
            producers: HashMap::new(),
            roots: Vec::new(),
        }
    }

    /// Lower an interior node into its "current children" set.
    fn lower(&mut self, node: &LogicalNode) -> ExecResult<Vec<PlanNode>> {
        match node {
            LogicalNode::Scan(scan) => {
                let segments =
                    self.collab
                        .segments
                        .segments(&scan.db, &scan.table, &scan.partitions)?;
                let mut children = Vec::with_capacity(segments.len());
                for segment in segments {
                    self.leases.push(segment.id());
                    children.push(PlanNode::SegmentScan {
                        segment,
                        columns: scan.columns.clone(),
                    });
                }
                Ok(children)
            }
            LogicalNode::MergeSort(ms) => {
                let inputs = ms
                    .sources
                    .iter()
                    .map(|src| {
                        if src.node == *self.local {
                            PlanNode::LocalStream(src.stream_id)
                        } else {
                            PlanNode::ExchangeIn {
                                stream_id: src.stream_id,
                            }
                        }
                    })
                    .collect();
                Ok(vec![PlanNode::Merge {
                    inputs,
                    key_column: ms.key_column.clone(),
                }])
            }
            LogicalNode::NodeOut(_) | LogicalNode::Output(_) => Err(EngineError::Plan(
                "pipeline root node nested below another node".to_string(),
            )),
        }
    }

    fn lower_root(&mut self, node: &LogicalNode) -> ExecResult<()> {
        match node {
            LogicalNode::NodeOut(out) => {
                let mut children = self.lower(&out.child)?;
                let producer = if children.len() == 1 {
                    children.remove(0)
                } else {
                    // Degenerate merge to fan multiple children into the
                    // single outbound edge. Zero children yields an
                    // immediately-exhausted merge.
                    PlanNode::Merge {
                        inputs: children,
                        key_column: out.merge_key.clone(),
                    }
                };
                if out.dest == *self.local {
                    if self.producers.contains_key(&out.stream_id) {
                        return Err(EngineError::Plan(format!(
                            "duplicate local producer for {}",
                            out.stream_id
                        )));
                    }
                    self.producers.insert(out.stream_id, producer);
                } else {
                    self.roots.push(PlanRoot::ExchangeOut {
                        dest: out.dest.clone(),
                        stream_id: out.stream_id,
                        input: producer,
                    });
                }
                Ok(())
            }
            LogicalNode::Output(output) => {
                let mut children = self.lower(&output.child)?;
                if children.len() != 1 {
                    return Err(EngineError::Plan(format!(
                        "output expects exactly one child, got {}",
                        children.len()
                    )));
                }
                self.roots.push(PlanRoot::Output {
                    input: children.remove(0),
                });
                Ok(())
            }
            LogicalNode::Scan(_) | LogicalNode::MergeSort(_) => Err(EngineError::Plan(
                "fragment root must be a node-out or output node".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Instantiation
// ---------------------------------------------------------------------------

fn instantiate(
    node: PlanNode,
    ctx: &Arc<QueryContext>,
    collab: &Collaborators,
) -> ExecResult<Box<dyn BatchOperator>> {
    match node {
        PlanNode::SegmentScan { segment, columns } => Ok(Box::new(SegmentScanOp::from_segment(
            ctx.clone(),
            &segment,
            &columns,
        )?)),
        PlanNode::Merge { inputs, key_column } => {
            let ops = inputs
                .into_iter()
                .map(|n| instantiate(n, ctx, collab))
                .collect::<ExecResult<Vec<_>>>()?;
            Ok(Box::new(MergeOp::new(
                ctx.clone(),
                ops,
                key_column,
                collab.config.merge_batch_rows,
            )))
        }
        PlanNode::ExchangeIn { stream_id } => Ok(Box::new(ExchangeInOp::new(
            ctx.clone(),
            stream_id,
            collab.streams.clone(),
            Duration::from_millis(collab.config.stream_register_timeout_ms),
        ))),
        PlanNode::LocalStream(stream_id) => Err(EngineError::Invariant(format!(
            "unresolved local stream {stream_id} reached instantiation"
        ))),
    }
}

// ---------------------------------------------------------------------------
// build_dag
// ---------------------------------------------------------------------------

/// Translate `fragments` into a runnable `Dag`.
///
/// Segments leased during the build are released here on the error path
/// and by `Dag::run`'s cleanup otherwise.
pub fn build_dag(
    fragments: &[Fragment],
    sink: Box<dyn OutputSink>,
    ctx: Arc<QueryContext>,
    collab: &Collaborators,
) -> ExecResult<Dag> {
    let local = collab.conns.local_node().clone();
    let mut lowering = Lowering::new(&local, collab);

    let built = (|| -> ExecResult<Vec<Box<dyn PipelineRoot>>> {
        for fragment in fragments {
            if fragment.roots.len() != 1 {
                return Err(EngineError::Plan(format!(
                    "fragment has {} roots, expected exactly 1",
                    fragment.roots.len()
                )));
            }
            lowering.lower_root(&fragment.roots[0])?;
        }
        let roots = resolve_local_streams(
            std::mem::take(&mut lowering.roots),
            &mut lowering.producers,
        )?;
        for stream_id in lowering.producers.keys() {
            tracing::warn!(
                query_id = %ctx.query_id(),
                stream_id = %stream_id,
                "local producer was never consumed"
            );
        }

        let mut sink = Some(sink);
        let mut runnable: Vec<Box<dyn PipelineRoot>> = Vec::with_capacity(roots.len());
        for root in roots {
            match root {
                PlanRoot::ExchangeOut {
                    dest,
                    stream_id,
                    input,
                } => {
                    let child = instantiate(input, &ctx, collab)?;
                    runnable.push(Box::new(ExchangeOutOp::new(
                        ctx.clone(),
                        child,
                        dest,
                        stream_id,
                        collab.conns.clone(),
                        collab.config.exchange_channel_capacity,
                    )));
                }
                PlanRoot::Output { input } => {
                    let out_sink = sink.take().ok_or_else(|| {
                        EngineError::Plan("more than one output root in query".to_string())
                    })?;
                    let child = instantiate(input, &ctx, collab)?;
                    runnable.push(Box::new(OutputOp::new(ctx.clone(), child, out_sink)));
                }
            }
        }
        tracing::debug!(
            query_id = %ctx.query_id(),
            roots = runnable.len(),
            leased = lowering.leases.len(),
            "dag built"
        );
        Ok(runnable)
    })();

    match built {
        Ok(runnable) => Ok(Dag {
            ctx,
            roots: runnable,
            leases: std::mem::take(&mut lowering.leases),
            segments: collab.segments.clone(),
            streams: collab.streams.clone(),
        }),
        Err(e) => {
            for id in &lowering.leases {
                collab.segments.release(*id);
            }
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

/// Runnable query execution graph.
pub struct Dag {
    ctx: Arc<QueryContext>,
    roots: Vec<Box<dyn PipelineRoot>>,
    leases: Vec<SegmentId>,
    segments: Arc<dyn SegmentRegistry>,
    streams: Arc<StreamRegistry>,
}

impl std::fmt::Debug for Dag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dag")
            .field("roots", &self.roots.len())
            .field("leases", &self.leases)
            .finish()
    }
}

impl Dag {
    pub fn context(&self) -> &Arc<QueryContext> {
        &self.ctx
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Drive every pipeline root to completion.
    ///
    /// The first failing root cancels the shared context; peers unwind
    /// with `Canceled`, which is not recorded as a failure. Cleanup runs
    /// unconditionally after all roots have settled.
    pub async fn run(mut self) -> ExecResult<()> {
        let mut tasks = JoinSet::new();
        for mut root in self.roots.drain(..) {
            tasks.spawn(async move {
                let name = root.name().to_string();
                let result = root.run().await;
                (name, result)
            });
        }

        let mut first_err: Option<EngineError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(root = %name, "pipeline root finished");
                }
                Ok((name, Err(e))) if e.is_canceled() => {
                    self.ctx.cancel_quiet();
                    tracing::debug!(root = %name, "pipeline root unwound after cancel");
                }
                Ok((name, Err(e))) => {
                    tracing::warn!(root = %name, error = %e, "pipeline root failed");
                    self.ctx.cancel(e.to_exec_error(self.ctx.node_name()));
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    let detail = if join_err.is_panic() {
                        let payload = join_err.into_panic();
                        payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "opaque panic payload".to_string())
                    } else {
                        join_err.to_string()
                    };
                    let e = EngineError::Invariant(format!("pipeline root panicked: {detail}"));
                    tracing::error!(error = %e, "pipeline root panicked");
                    self.ctx.cancel(e.to_exec_error(self.ctx.node_name()));
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        // Cleanup is unconditional: one release per lease, then drop any
        // inbound streams the query never consumed.
        for id in self.leases.drain(..) {
            self.segments.release(id);
        }
        self.streams.purge_query(self.ctx.query_id());

        match first_err {
            Some(e) => Err(e),
            None if self.ctx.is_canceled() => Err(EngineError::Canceled),
            None => Ok(()),
        }
    }
}
