//! Cluster collaborator interface: node name to gRPC channel resolution.
//!
//! The engine does not manage membership. It asks a `ConnRegistry` for a
//! channel to a named peer; the in-tree `StaticConnRegistry` resolves names
//! through a fixed address table and caches one channel per peer,
//! invalidating on transport errors so the next call reconnects.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tonic::transport::{Channel, Endpoint};

use kestrel_common::error::{EngineError, ExecResult};
use kestrel_common::types::NodeName;

/// Resolve cluster node names to ready gRPC channels.
#[async_trait]
pub trait ConnRegistry: Send + Sync {
    /// Channel to `node`, connecting if necessary.
    async fn channel(&self, node: &NodeName) -> ExecResult<Channel>;

    /// Drop any cached channel for `node` after a transport error.
    fn invalidate(&self, node: &NodeName);

    /// Name of the local node.
    fn local_node(&self) -> &NodeName;
}

/// Fixed-table registry with per-node cached channels.
pub struct StaticConnRegistry {
    local: NodeName,
    endpoints: HashMap<NodeName, String>,
    channels: DashMap<NodeName, Channel>,
    connect_timeout: Duration,
}

impl StaticConnRegistry {
    pub fn new(
        local: NodeName,
        endpoints: HashMap<NodeName, String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            local,
            endpoints,
            channels: DashMap::new(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl ConnRegistry for StaticConnRegistry {
    async fn channel(&self, node: &NodeName) -> ExecResult<Channel> {
        if let Some(ch) = self.channels.get(node) {
            return Ok(ch.clone());
        }
        let endpoint = self.endpoints.get(node).ok_or_else(|| {
            EngineError::Transport(format!("unknown node {node} in connection registry"))
        })?;
        let ch = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| EngineError::Transport(format!("invalid endpoint {endpoint}: {e}")))?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .map_err(|e| EngineError::Transport(format!("connect to {node} failed: {e}")))?;
        self.channels.insert(node.clone(), ch.clone());
        Ok(ch)
    }

    fn invalidate(&self, node: &NodeName) {
        self.channels.remove(node);
    }

    fn local_node(&self) -> &NodeName {
        &self.local
    }
}
