//! The interface a consensus engine uses to talk to its peers.

use {
    crate::{
        error::Result,
        message::{
            AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
            InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse,
        },
        peer::PeerAddress,
        pipeline::AppendPipeline,
        rpc::{RpcConsumer, SnapshotReader},
    },
    async_trait::async_trait,
};

/// Network transport between cluster members.
///
/// Outbound calls look blocking to the caller: each resolves to the peer's
/// response or a typed error within the transport's configured deadline.
/// Inbound RPCs from every peer are multiplexed onto [`Self::consumer`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue of RPCs sent to this node.
    fn consumer(&self) -> RpcConsumer;

    /// This node's address as seen by its peers.
    fn local_addr(&self) -> PeerAddress;

    /// Open a pipeline for streaming append-entries requests to `target`.
    async fn append_entries_pipeline(&self, target: &PeerAddress) -> Result<AppendPipeline>;

    /// Replicate entries (or heartbeat) to `target`.
    async fn append_entries(
        &self,
        target: &PeerAddress,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Ask `target` for its vote.
    async fn request_vote(
        &self,
        target: &PeerAddress,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Push a snapshot to `target`.  `data` must yield exactly
    /// `request.size` bytes; the follower drains it before answering.
    async fn install_snapshot(
        &self,
        target: &PeerAddress,
        request: InstallSnapshotRequest,
        data: SnapshotReader,
    ) -> Result<InstallSnapshotResponse>;

    /// Serialize a peer address for durable storage.
    fn encode_peer(&self, peer: &PeerAddress) -> Vec<u8> {
        peer.encode()
    }

    /// Inverse of [`Self::encode_peer`].
    fn decode_peer(&self, buf: &[u8]) -> Result<PeerAddress> {
        PeerAddress::decode(buf)
    }

    /// Stop serving and fail further outbound calls.  Idempotent.
    async fn close(&self) -> Result<()>;
}
