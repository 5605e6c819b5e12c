//! Error types for the raft transport layer.

use {crate::peer::PeerAddress, thiserror::Error};

/// Errors surfaced by transports, pipelines and append futures.
///
/// Transport-level failures are always returned as values so the consensus
/// engine can apply its own retry and backoff policy.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer could not be contacted (unknown, refused, or dropped).
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable {
        /// Target of the failed call.
        peer: PeerAddress,
        /// Human-readable cause.
        reason: String,
    },

    /// No reply arrived within the configured deadline.
    #[error("rpc timed out after {0}ms")]
    Timeout(u64),

    /// The pipeline was used after `close`.
    #[error("append pipeline closed")]
    PipelineClosed,

    /// The request was still in flight when its pipeline was closed.
    #[error("request cancelled by pipeline close")]
    Cancelled,

    /// The remote handler answered with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// The handler dropped the RPC without ever responding.
    #[error("handler dropped rpc without responding")]
    NoReply,

    /// The transport has been shut down.
    #[error("transport shutdown")]
    TransportShutdown,

    /// The peer answered with a response of the wrong kind.
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        /// Kind tag of the request that was sent.
        expected: &'static str,
        /// Kind tag of the response that came back.
        got: &'static str,
    },

    /// Failed to serialize or deserialize a frame.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Transport-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Bytes that do not decode to a peer address.
    #[error("invalid peer address: {0}")]
    InvalidPeer(String),
}

impl TransportError {
    /// Build a handler error, the way a consensus engine rejects an RPC.
    pub fn remote(reason: impl Into<String>) -> Self {
        Self::Remote(reason.into())
    }

    /// Build an `Unreachable` error for `peer`.
    pub fn unreachable(peer: &PeerAddress, reason: impl ToString) -> Self {
        Self::Unreachable {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }

    /// Whether a caller may reasonably retry the same RPC later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Timeout(_) | Self::Io(_)
        )
    }

    /// Text carried over the wire for errors raised by a remote handler.
    pub(crate) fn wire_reason(&self) -> String {
        match self {
            Self::Remote(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Convenience result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
