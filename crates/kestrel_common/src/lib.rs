//! Shared building blocks for KestrelDB: identifiers, the error taxonomy
//! and execution-layer configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::ExecConfig;
pub use error::{EngineError, ErrorKind, ExecError, ExecResult};
pub use types::{NodeName, PartitionId, QueryId, SegmentId, StreamId};
