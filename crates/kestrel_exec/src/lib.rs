//! Physical execution layer for distributed queries — operator DAGs over
//! columnar batches, shuffled between nodes on gRPC streams and merged
//! into one globally ordered result stream.
//!
//! The planner hands `dag::build_dag` a set of logical fragments plus an
//! output sink; the builder lowers them into pipeline roots (network
//! senders and the terminal output writer), rewires same-node edges into
//! direct operator references, and returns a `Dag` that drives one task
//! per root. Storage and cluster membership are external collaborators
//! behind the `segment` and `cluster` traits.

pub mod batch;
pub mod cluster;
pub mod column;
pub mod context;
pub mod dag;
pub mod exchange;
pub mod merge;
pub mod operator;
pub mod output;
pub mod plan;
pub mod segment;
pub mod source;

/// Protobuf types and tonic client/server for the exchange protocol.
/// Re-exported from the `kestrel_proto` crate (generated at build time).
pub use kestrel_proto::kestrel_exchange as proto;

pub use batch::Batch;
pub use column::{Col, ColumnType, Vector, VectorBuilder};
pub use context::QueryContext;
pub use dag::{build_dag, Collaborators, Dag};
pub use exchange::{ExchangeInOp, ExchangeOutOp, ExchangeService, StreamRegistry};
pub use merge::MergeOp;
pub use operator::{BatchOperator, ColumnOperator, PipelineRoot};
pub use output::{MemSink, OutputOp, OutputSink, WriterSink};
pub use plan::{Fragment, LogicalNode};
pub use source::{SegmentColumnOp, SegmentScanOp};
