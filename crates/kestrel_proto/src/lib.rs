//! Generated protobuf types and gRPC service definitions for the
//! KestrelDB exchange wire protocol.

pub mod kestrel_exchange {
    tonic::include_proto!("kestrel_exchange");
}
