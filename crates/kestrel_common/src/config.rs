use serde::{Deserialize, Serialize};

/// Execution-layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Row-count target for merge output batches (default: 1024).
    #[serde(default = "default_merge_batch_rows")]
    pub merge_batch_rows: usize,
    /// Bounded channel capacity between the exchange service and the
    /// consuming operator, in batches (default: 16).
    #[serde(default = "default_exchange_channel_capacity")]
    pub exchange_channel_capacity: usize,
    /// RPC connect timeout in milliseconds (default: 3000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long an inbound exchange operator waits for its stream to be
    /// registered by the service before giving up, in milliseconds
    /// (default: 10000).
    #[serde(default = "default_stream_register_timeout_ms")]
    pub stream_register_timeout_ms: u64,
}

fn default_merge_batch_rows() -> usize {
    1024
}

fn default_exchange_channel_capacity() -> usize {
    16
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_stream_register_timeout_ms() -> u64 {
    10_000
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            merge_batch_rows: default_merge_batch_rows(),
            exchange_channel_capacity: default_exchange_channel_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stream_register_timeout_ms: default_stream_register_timeout_ms(),
        }
    }
}

impl ExecConfig {
    /// Reject configurations that cannot work at all.
    pub fn validate(&self) -> Result<(), String> {
        if self.merge_batch_rows == 0 {
            return Err("merge_batch_rows must be > 0".into());
        }
        if self.exchange_channel_capacity == 0 {
            return Err("exchange_channel_capacity must be > 0".into());
        }
        Ok(())
    }
}
