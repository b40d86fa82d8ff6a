//! Network exchange: batch shuffle between execution nodes.
//!
//! One `Shuffle` RPC stream carries one `(query, stream)` pair. The
//! producer side is `ExchangeOutOp`, a pipeline root that drains its
//! subtree into the RPC. The server side (`service.rs`) decodes frames
//! into a bounded channel registered in the shared `StreamRegistry`; the
//! consumer side is `ExchangeInOp`, a batch operator that binds to that
//! channel. Half-close is the only end-of-stream signal on the wire; a
//! failing producer sends an explicit error frame first so the consumer
//! can tell failure from completion.

pub mod codec;
pub mod service;

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_stream::wrappers::ReceiverStream;

use kestrel_common::error::{EngineError, ExecError, ExecResult};
use kestrel_common::types::{NodeName, QueryId, StreamId};

use crate::batch::Batch;
use crate::cluster::ConnRegistry;
use crate::context::QueryContext;
use crate::operator::{BatchOperator, PipelineRoot};
use crate::proto;
use crate::proto::vector_exchange_client::VectorExchangeClient;
use crate::proto::vector_exchange_msg::Msg;

pub use service::ExchangeService;

/// Decoded inbound frame.
#[derive(Debug)]
pub enum ExchangeFrame {
    Batch(Batch),
    Error(ExecError),
}

/// Shared table of inbound exchange streams, keyed by `(query, stream)`.
///
/// The gRPC service registers a receiver as soon as it has read a valid
/// header; the consuming `ExchangeInOp` takes it, waiting up to its
/// configured timeout for registration to happen. Explicitly injected
/// wherever it is needed; there is no process-global instance.
#[derive(Default)]
pub struct StreamRegistry {
    streams: DashMap<(QueryId, StreamId), mpsc::Receiver<ExchangeFrame>>,
    registered: Notify,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        query_id: QueryId,
        stream_id: StreamId,
        rx: mpsc::Receiver<ExchangeFrame>,
    ) {
        if self.streams.insert((query_id, stream_id), rx).is_some() {
            tracing::warn!(
                query_id = %query_id,
                stream_id = %stream_id,
                "duplicate exchange stream registration, dropping previous"
            );
        }
        self.registered.notify_waiters();
    }

    /// Take the receiver for `(query_id, stream_id)`, waiting up to
    /// `wait` for it to be registered.
    pub async fn take(
        &self,
        query_id: QueryId,
        stream_id: StreamId,
        wait: Duration,
    ) -> ExecResult<mpsc::Receiver<ExchangeFrame>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let mut notified = pin!(self.registered.notified());
            // Register interest before the lookup so a registration between
            // the lookup and the await cannot be missed.
            notified.as_mut().enable();
            if let Some((_, rx)) = self.streams.remove(&(query_id, stream_id)) {
                return Ok(rx);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(EngineError::Transport(format!(
                    "inbound {stream_id} of {query_id} not registered within {wait:?}"
                )));
            }
        }
    }

    /// Drop any streams of `query_id` that were never consumed.
    pub fn purge_query(&self, query_id: QueryId) {
        self.streams.retain(|(qid, stream_id), _| {
            if *qid == query_id {
                tracing::warn!(
                    query_id = %query_id,
                    stream_id = %stream_id,
                    "dropping unconsumed inbound exchange stream"
                );
                false
            } else {
                true
            }
        });
    }
}

// ---------------------------------------------------------------------------
// ExchangeOutOp
// ---------------------------------------------------------------------------

/// Pipeline root that ships its subtree's batches to a peer node.
pub struct ExchangeOutOp {
    ctx: Arc<QueryContext>,
    child: Box<dyn BatchOperator>,
    dest: NodeName,
    stream_id: StreamId,
    conns: Arc<dyn ConnRegistry>,
    channel_capacity: usize,
    label: String,
}

impl ExchangeOutOp {
    pub fn new(
        ctx: Arc<QueryContext>,
        child: Box<dyn BatchOperator>,
        dest: NodeName,
        stream_id: StreamId,
        conns: Arc<dyn ConnRegistry>,
        channel_capacity: usize,
    ) -> Self {
        let label = format!("exchange_out:{dest}/{stream_id}");
        Self {
            ctx,
            child,
            dest,
            stream_id,
            conns,
            channel_capacity,
            label,
        }
    }
}

#[async_trait]
impl PipelineRoot for ExchangeOutOp {
    async fn run(&mut self) -> ExecResult<()> {
        self.child.init().await?;

        let channel = self.conns.channel(&self.dest).await?;
        let mut client = VectorExchangeClient::new(channel);
        let (tx, rx) = mpsc::channel::<proto::VectorExchangeMsg>(self.channel_capacity);
        let outbound = ReceiverStream::new(rx);
        let call = tokio::spawn(async move { client.shuffle(outbound).await });

        let header = proto::VectorExchangeMsg {
            msg: Some(Msg::Header(proto::Header {
                query_id: self.ctx.query_id().as_bytes().to_vec(),
                stream_id: self.stream_id.0,
            })),
        };
        let mut result: ExecResult<()> = if tx.send(header).await.is_err() {
            Err(EngineError::Transport(format!(
                "{}: stream closed before header",
                self.label
            )))
        } else {
            Ok(())
        };

        if result.is_ok() {
            result = loop {
                let batch = tokio::select! {
                    _ = self.ctx.done() => break Err(EngineError::Canceled),
                    r = self.child.next() => match r {
                        Ok(b) => b,
                        Err(e) => {
                            // Tell the peer before disconnecting so it can
                            // distinguish failure from completion.
                            let exec = e.to_exec_error(self.ctx.node_name());
                            let frame = proto::VectorExchangeMsg {
                                msg: Some(Msg::Error(codec::encode_error(&exec))),
                            };
                            let _ = tx.send(frame).await;
                            break Err(e);
                        }
                    },
                };
                if batch.is_end_of_stream() {
                    break Ok(());
                }
                tracing::debug!(out = %self.label, rows = batch.len(), "shipping batch");
                let frame = proto::VectorExchangeMsg {
                    msg: Some(Msg::Batch(codec::encode_batch(&batch))),
                };
                if tx.send(frame).await.is_err() {
                    break Err(EngineError::Transport(format!(
                        "{}: stream closed by peer mid-send",
                        self.label
                    )));
                }
            };
        }

        self.child.close().await;
        // Dropping the sender half-closes the RPC stream; that is the
        // end-of-stream signal, there is no trailer frame.
        drop(tx);

        match call.await {
            Ok(Ok(_ack)) => result,
            Ok(Err(status)) => {
                self.conns.invalidate(&self.dest);
                match result {
                    Err(e) if !matches!(e, EngineError::Transport(_)) => Err(e),
                    _ => Err(EngineError::from_status(status)),
                }
            }
            Err(join) => result.and(Err(EngineError::Transport(format!(
                "{}: rpc task failed: {join}",
                self.label
            )))),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

// ---------------------------------------------------------------------------
// ExchangeInOp
// ---------------------------------------------------------------------------

/// Batch operator reading one registered inbound exchange stream.
pub struct ExchangeInOp {
    ctx: Arc<QueryContext>,
    stream_id: StreamId,
    registry: Arc<StreamRegistry>,
    register_timeout: Duration,
    rx: Option<mpsc::Receiver<ExchangeFrame>>,
    finished: bool,
    label: String,
}

impl ExchangeInOp {
    pub fn new(
        ctx: Arc<QueryContext>,
        stream_id: StreamId,
        registry: Arc<StreamRegistry>,
        register_timeout: Duration,
    ) -> Self {
        let label = format!("exchange_in:{stream_id}");
        Self {
            ctx,
            stream_id,
            registry,
            register_timeout,
            rx: None,
            finished: false,
            label,
        }
    }
}

#[async_trait]
impl BatchOperator for ExchangeInOp {
    async fn init(&mut self) -> ExecResult<()> {
        if self.rx.is_some() {
            return Ok(());
        }
        let rx = tokio::select! {
            _ = self.ctx.done() => return Err(EngineError::Canceled),
            r = self.registry.take(
                self.ctx.query_id(),
                self.stream_id,
                self.register_timeout,
            ) => r?,
        };
        self.rx = Some(rx);
        Ok(())
    }

    async fn next(&mut self) -> ExecResult<Batch> {
        if self.finished {
            return Ok(Batch::end_of_stream());
        }
        let rx = self.rx.as_mut().ok_or_else(|| {
            EngineError::Invariant(format!("{}: next before init", self.label))
        })?;
        tokio::select! {
            _ = self.ctx.done() => Err(EngineError::Canceled),
            frame = rx.recv() => match frame {
                // Sender dropped: the producer half-closed, stream complete.
                None => {
                    self.finished = true;
                    Ok(Batch::end_of_stream())
                }
                Some(ExchangeFrame::Batch(batch)) => Ok(batch),
                Some(ExchangeFrame::Error(err)) => {
                    self.finished = true;
                    Err(EngineError::Remote(err))
                }
            },
        }
    }

    async fn close(&mut self) {
        self.rx = None;
        self.finished = true;
    }

    fn name(&self) -> &str {
        &self.label
    }
}
