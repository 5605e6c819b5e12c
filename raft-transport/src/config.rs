//! Configuration for the raft transport layer.

use std::{net::SocketAddr, time::Duration};

/// Configuration for raft RPC transports.
///
/// Controls deadlines, pipelining depth, and connection reuse for the
/// vote, append and snapshot RPCs exchanged between cluster members.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local address to bind the RPC listener on.
    /// Default: `0.0.0.0:8300`
    pub bind_addr: SocketAddr,

    /// How long a blocking RPC waits for its reply before failing (ms).
    pub rpc_timeout_ms: u64,

    /// How long to wait for an outbound TCP connection to establish (ms).
    pub connect_timeout_ms: u64,

    /// Snapshot bytes covered by one `rpc_timeout_ms` when installing a
    /// snapshot. Larger snapshots get a proportionally longer deadline.
    pub timeout_scale: u64,

    /// Maximum number of in-flight requests per append pipeline.
    /// Submitting beyond this blocks the leader's replication task.
    pub max_pipeline_window: usize,

    /// Idle connections kept per peer for blocking RPCs.
    pub max_pool: usize,

    /// Maximum size of a single serialized frame in bytes.
    /// Append batches can carry many entries, so this is generous.
    pub max_message_size: usize,

    /// Capacity of the inbound RPC queue feeding the consensus engine.
    pub channel_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8300)),
            rpc_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            timeout_scale: 262_144, // 256 KiB
            max_pipeline_window: 128,
            max_pool: 3,
            max_message_size: 67_108_864, // 64 MiB
            channel_buffer_size: 1_024,
        }
    }
}

impl TransportConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            rpc_timeout_ms: 1_000,
            connect_timeout_ms: 500,
            timeout_scale: 262_144, // 256 KiB
            max_pipeline_window: 8,
            max_pool: 2,
            max_message_size: 1_048_576,
            channel_buffer_size: 64,
        }
    }

    /// Deadline for a single blocking RPC.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Deadline for establishing an outbound connection.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Deadline for installing a snapshot of `size` bytes.
    ///
    /// Never shorter than [`Self::rpc_timeout`].
    pub fn snapshot_timeout(&self, size: u64) -> Duration {
        let scale = size.checked_div(self.timeout_scale).unwrap_or(0).max(1);
        let ms = self.rpc_timeout_ms.saturating_mul(scale);
        Duration::from_millis(ms)
    }

    /// Pipeline window, clamped to at least one in-flight request.
    pub fn pipeline_window(&self) -> usize {
        self.max_pipeline_window.max(1)
    }
}
