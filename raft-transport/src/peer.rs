//! Peer identity and its persistable byte form.
//!
//! A [`PeerAddress`] is the key for all per-peer state (pooled connections,
//! pipelines) and is what the consensus engine writes into its membership
//! records.  Encoding is pure and carries no live connection state, so an
//! address read back from storage is equal to the one that was written.

use {
    crate::error::{Result, TransportError},
    serde::{Deserialize, Serialize},
    std::{
        fmt,
        net::{SocketAddr, ToSocketAddrs},
    },
};

/// Opaque network identity of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Wrap an address string (`host:port` for TCP, any label in memory).
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The address as written by the operator or transport.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Serialize for durable storage.
    pub fn encode(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Inverse of [`Self::encode`].  Fails only on bytes that are not
    /// UTF-8, so every address this type can hold reads back unchanged.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        std::str::from_utf8(buf)
            .map(Self::new)
            .map_err(|e| TransportError::InvalidPeer(e.to_string()))
    }

    /// Resolve to a socket address for the TCP transport.
    ///
    /// This may hit the system resolver, so it is never used by the codec.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.0
            .to_socket_addrs()
            .map_err(|e| TransportError::unreachable(self, e))?
            .next()
            .ok_or_else(|| TransportError::unreachable(self, "address resolved to nothing"))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for PeerAddress {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}
