use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for `Result<T, EngineError>`.
pub type ExecResult<T> = Result<T, EngineError>;

/// Structured execution error that crosses process boundaries unchanged.
///
/// Created exactly once at the site of the original failure and forwarded
/// verbatim from node to node, so the caller always sees the first failing
/// node's name and stack, never a re-wrapped copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    /// Unique id assigned where the error originated.
    pub id: Uuid,
    /// Human-readable failure description.
    pub detail: String,
    /// Name of the node the error originated on.
    pub node_name: String,
    /// Backtrace captured at the origin, best effort.
    pub stack: String,
}

impl ExecError {
    /// Capture a new error at the point of failure.
    pub fn new(detail: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            detail: detail.into(),
            node_name: node_name.into(),
            stack: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.detail.clone())
    }

    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}] {}", self.id, self.node_name, self.detail)
    }
}

/// Error classification for escalation decisions.
///
/// - `UserError`   — malformed plan or unsupported fragment shape; caller's input
/// - `Network`     — RPC/transport failure between nodes
/// - `Remote`      — failure that originated on a peer, already structured
/// - `Storage`     — storage collaborator failure
/// - `Canceled`    — cooperative cancellation; NOT a failure
/// - `InternalBug` — broken engine invariant; should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Network,
    Remote,
    Storage,
    Canceled,
    InternalBug,
}

/// Top-level error type for the execution layer.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Broken engine invariant (mismatched column lengths, unresolved
    /// placeholder, unknown wire discriminant). Unrecoverable.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Rejected plan shape or unknown logical node.
    #[error("Plan error: {0}")]
    Plan(String),

    /// Connection-level transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// RPC-level failure reported by tonic.
    #[error("RPC status: {0}")]
    Status(#[from] tonic::Status),

    /// Error that originated on a peer node, forwarded unchanged.
    #[error("Remote error: {0}")]
    Remote(ExecError),

    /// Storage collaborator failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The query was cancelled cooperatively.
    #[error("Query canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encode/decode failure.
    #[error("Codec error: {0}")]
    Codec(String),
}

impl EngineError {
    /// Classify this error for escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Plan(_) => ErrorKind::UserError,
            EngineError::Transport(_) => ErrorKind::Network,
            EngineError::Status(_) => ErrorKind::Network,
            EngineError::Io(_) => ErrorKind::Network,
            EngineError::Remote(_) => ErrorKind::Remote,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Canceled => ErrorKind::Canceled,
            EngineError::Invariant(_) => ErrorKind::InternalBug,
            EngineError::Codec(_) => ErrorKind::InternalBug,
        }
    }

    /// Returns true if this is cooperative cancellation rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self.kind(), ErrorKind::Canceled)
    }

    /// Returns true if this is a broken engine invariant.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// The wire-portable error record for this error.
    ///
    /// A `Remote` error passes through unchanged so the origin node's id,
    /// name and stack survive any number of hops. Every other variant is
    /// captured fresh on `node_name`.
    pub fn to_exec_error(&self, node_name: &str) -> ExecError {
        match self {
            EngineError::Remote(e) => e.clone(),
            other => ExecError::new(other.to_string(), node_name),
        }
    }

    /// Map onto a `tonic::Status` carrying the serialized `ExecError`.
    pub fn to_status(&self, node_name: &str) -> tonic::Status {
        if let EngineError::Canceled = self {
            return tonic::Status::cancelled("query canceled");
        }
        tonic::Status::internal(self.to_exec_error(node_name).to_json())
    }

    /// Recover an `EngineError` from a `tonic::Status`.
    ///
    /// A status whose message is a serialized `ExecError` becomes `Remote`
    /// so the origin record survives the hop; anything else stays `Status`.
    pub fn from_status(status: tonic::Status) -> EngineError {
        if status.code() == tonic::Code::Cancelled {
            return EngineError::Canceled;
        }
        match ExecError::from_json(status.message()) {
            Some(exec) => EngineError::Remote(exec),
            None => EngineError::Status(status),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Codec(e.to_string())
    }
}
