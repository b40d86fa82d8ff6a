//! Server side of the `Shuffle` RPC: decode inbound frames into a
//! bounded channel and hand the receiver to the local consumer through
//! the `StreamRegistry`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::{Request, Response, Status, Streaming};

use kestrel_common::types::QueryId;

use crate::proto;
use crate::proto::vector_exchange_msg::Msg;
use crate::proto::vector_exchange_server::VectorExchange;

use super::{codec, ExchangeFrame, StreamRegistry};

/// gRPC handler for inbound exchange streams.
///
/// One `shuffle` call carries one `(query, stream)` pair. The handler
/// registers a receiver under that key as soon as it has read a valid
/// header, then decodes frames into it until the producer half-closes.
/// Returning from the handler drops the sender, which is the consumer's
/// end-of-stream signal.
pub struct ExchangeService {
    registry: Arc<StreamRegistry>,
    node_name: String,
    channel_capacity: usize,
}

impl ExchangeService {
    pub fn new(
        registry: Arc<StreamRegistry>,
        node_name: impl Into<String>,
        channel_capacity: usize,
    ) -> Self {
        Self {
            registry,
            node_name: node_name.into(),
            channel_capacity,
        }
    }

    /// Wrap into the generated tonic server, ready to mount on a router.
    pub fn into_server(
        self,
    ) -> proto::vector_exchange_server::VectorExchangeServer<ExchangeService> {
        proto::vector_exchange_server::VectorExchangeServer::new(self)
    }
}

#[tonic::async_trait]
impl VectorExchange for ExchangeService {
    async fn shuffle(
        &self,
        request: Request<Streaming<proto::VectorExchangeMsg>>,
    ) -> Result<Response<proto::ShuffleAck>, Status> {
        let mut inbound = request.into_inner();

        let header = match inbound.message().await? {
            Some(proto::VectorExchangeMsg {
                msg: Some(Msg::Header(h)),
            }) => h,
            Some(_) => {
                return Err(Status::invalid_argument(
                    "first exchange frame must be a header",
                ));
            }
            None => {
                return Err(Status::invalid_argument(
                    "exchange stream closed before header",
                ));
            }
        };
        let query_id = QueryId::from_slice(&header.query_id)
            .ok_or_else(|| Status::invalid_argument("malformed query id in header"))?;
        let stream_id = kestrel_common::types::StreamId(header.stream_id);

        tracing::debug!(
            query_id = %query_id,
            stream_id = %stream_id,
            "inbound exchange stream opened"
        );

        let (tx, rx) = mpsc::channel::<ExchangeFrame>(self.channel_capacity);
        self.registry.register(query_id, stream_id, rx);

        while let Some(frame) = inbound.message().await? {
            match frame.msg {
                Some(Msg::Batch(wire)) => {
                    let batch = codec::decode_batch(wire)
                        .map_err(|e| e.to_status(&self.node_name))?;
                    if tx.send(ExchangeFrame::Batch(batch)).await.is_err() {
                        // Consumer gone; drain nothing further.
                        tracing::debug!(
                            query_id = %query_id,
                            stream_id = %stream_id,
                            "exchange consumer dropped, closing inbound stream"
                        );
                        break;
                    }
                }
                Some(Msg::Error(wire)) => {
                    let err = codec::decode_error(wire);
                    tracing::warn!(
                        query_id = %query_id,
                        stream_id = %stream_id,
                        origin = %err.node_name,
                        "inbound exchange stream carries producer error"
                    );
                    let _ = tx.send(ExchangeFrame::Error(err)).await;
                    break;
                }
                Some(Msg::Header(_)) => {
                    return Err(Status::invalid_argument(
                        "duplicate header on exchange stream",
                    ));
                }
                None => {
                    return Err(Status::invalid_argument("empty exchange frame"));
                }
            }
        }

        // Dropping `tx` here closes the channel; the consumer reads that
        // as end of stream.
        Ok(Response::new(proto::ShuffleAck { ok: true }))
    }
}
