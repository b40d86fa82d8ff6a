//! Operator contracts.
//!
//! Operators form a pull-based pipeline. Interior operators implement
//! `BatchOperator` (batch granularity) or `ColumnOperator` (single-vector
//! granularity, used directly above storage readers). Pipeline roots
//! implement `PipelineRoot` and drive their subtree themselves; the DAG
//! runner spawns one task per root.
//!
//! Contract:
//! - `init` is idempotent and must be called before the first `next`.
//! - `next` returns batches until the end-of-stream sentinel
//!   (`Batch::end_of_stream()`); callers must not pull past it.
//! - `close` cascades to children and is idempotent.

use async_trait::async_trait;

use kestrel_common::error::ExecResult;

use crate::batch::Batch;
use crate::column::Vector;

/// Batch-granularity pull operator.
#[async_trait]
pub trait BatchOperator: Send {
    async fn init(&mut self) -> ExecResult<()>;

    /// Pull the next batch. The zero-length sentinel means exhausted.
    async fn next(&mut self) -> ExecResult<Batch>;

    async fn close(&mut self);

    /// Short label for logs and failure reports.
    fn name(&self) -> &str;
}

/// Vector-granularity pull operator wrapping one storage column reader.
#[async_trait]
pub trait ColumnOperator: Send {
    async fn init(&mut self) -> ExecResult<()>;

    /// Pull the next vector; `None` means the column is exhausted.
    async fn next(&mut self) -> ExecResult<Option<Vector>>;

    async fn close(&mut self);

    fn name(&self) -> &str;
}

/// A root operator that drives its subtree to completion.
#[async_trait]
pub trait PipelineRoot: Send {
    /// Run until the subtree is exhausted or fails. Must observe the
    /// query context at every batch boundary and return `Canceled`
    /// promptly once the context is cancelled.
    async fn run(&mut self) -> ExecResult<()>;

    fn name(&self) -> &str;
}
