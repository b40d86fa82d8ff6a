//! Logical fragments and the physical plan tree.
//!
//! The planner hands the builder serde-friendly `Fragment`s. Lowering
//! produces an explicit sum-type physical tree (`PlanNode`/`PlanRoot`)
//! in which same-node edges are `LocalStream` placeholders; a pure
//! transform then replaces every placeholder with its recorded producer
//! subtree. Instantiation into executable operators happens afterwards,
//! in `dag.rs`. There is no in-place tree mutation anywhere.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kestrel_common::error::{EngineError, ExecResult};
use kestrel_common::types::{NodeName, PartitionId, StreamId};

use crate::segment::Segment;

fn default_merge_key() -> String {
    "ts".to_string()
}

// ---------------------------------------------------------------------------
// Logical plan (planner -> builder surface)
// ---------------------------------------------------------------------------

/// Subtree of the logical plan assigned to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    /// Exactly one root is supported; anything else is rejected.
    pub roots: Vec<LogicalNode>,
}

impl Fragment {
    pub fn new(root: LogicalNode) -> Self {
        Self { roots: vec![root] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogicalNode {
    Scan(ScanNode),
    NodeOut(NodeOutNode),
    MergeSort(MergeSortNode),
    Output(OutputNode),
}

/// Leaf: scan `columns` of one table, one physical scan per leased
/// segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanNode {
    pub db: String,
    pub table: String,
    /// Empty selects all partitions.
    #[serde(default)]
    pub partitions: Vec<PartitionId>,
    pub columns: Vec<String>,
}

/// Cross-node output edge: ship the child's rows to `dest` under
/// `stream_id`. Multiple children are merged first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutNode {
    pub dest: NodeName,
    pub stream_id: StreamId,
    #[serde(default = "default_merge_key")]
    pub merge_key: String,
    pub child: Box<LogicalNode>,
}

/// Cross-node input edge feeding a merge: one inbound stream per
/// contributing source node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSortNode {
    #[serde(default = "default_merge_key")]
    pub key_column: String,
    pub sources: Vec<MergeSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSource {
    pub node: NodeName,
    pub stream_id: StreamId,
}

/// Terminal: serialize the child's rows to the query's output sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputNode {
    pub child: Box<LogicalNode>,
}

// ---------------------------------------------------------------------------
// Physical plan
// ---------------------------------------------------------------------------

/// Physical plan tree. `LocalStream` is a placeholder for a same-node
/// producer, resolved by `resolve_local_streams`; it never reaches
/// instantiation.
#[derive(Debug, Clone)]
pub enum PlanNode {
    SegmentScan {
        segment: Arc<dyn Segment>,
        columns: Vec<String>,
    },
    Merge {
        inputs: Vec<PlanNode>,
        key_column: String,
    },
    ExchangeIn {
        stream_id: StreamId,
    },
    LocalStream(StreamId),
}

/// A self-driving pipeline root in physical form.
#[derive(Debug, Clone)]
pub enum PlanRoot {
    ExchangeOut {
        dest: NodeName,
        stream_id: StreamId,
        input: PlanNode,
    },
    Output {
        input: PlanNode,
    },
}

impl PlanNode {
    /// True if any `LocalStream` placeholder remains in this subtree.
    pub fn has_local_stream(&self) -> bool {
        match self {
            PlanNode::LocalStream(_) => true,
            PlanNode::Merge { inputs, .. } => inputs.iter().any(PlanNode::has_local_stream),
            PlanNode::SegmentScan { .. } | PlanNode::ExchangeIn { .. } => false,
        }
    }
}

impl PlanRoot {
    pub fn input(&self) -> &PlanNode {
        match self {
            PlanRoot::ExchangeOut { input, .. } | PlanRoot::Output { input } => input,
        }
    }
}

fn resolve_node(
    node: PlanNode,
    producers: &mut HashMap<StreamId, PlanNode>,
) -> ExecResult<PlanNode> {
    match node {
        PlanNode::LocalStream(stream_id) => producers.remove(&stream_id).ok_or_else(|| {
            EngineError::Invariant(format!(
                "local edge {stream_id} was declared but never produced"
            ))
        }),
        PlanNode::Merge { inputs, key_column } => Ok(PlanNode::Merge {
            inputs: inputs
                .into_iter()
                .map(|n| resolve_node(n, producers))
                .collect::<ExecResult<Vec<_>>>()?,
            key_column,
        }),
        other => Ok(other),
    }
}

/// Replace every `LocalStream` placeholder with its recorded producer
/// subtree. Each producer is consumed by exactly one placeholder; a
/// missing producer is a broken wiring invariant. Returns a new tree,
/// leaving unconsumed producers behind in `producers` for the caller to
/// report.
pub fn resolve_local_streams(
    roots: Vec<PlanRoot>,
    producers: &mut HashMap<StreamId, PlanNode>,
) -> ExecResult<Vec<PlanRoot>> {
    roots
        .into_iter()
        .map(|root| match root {
            PlanRoot::ExchangeOut {
                dest,
                stream_id,
                input,
            } => Ok(PlanRoot::ExchangeOut {
                dest,
                stream_id,
                input: resolve_node(input, producers)?,
            }),
            PlanRoot::Output { input } => Ok(PlanRoot::Output {
                input: resolve_node(input, producers)?,
            }),
        })
        .collect()
}
