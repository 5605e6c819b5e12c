//! RPC payloads and their wire representation.
//!
//! The request/response structs are what the consensus engine builds and
//! consumes.  [`WireRequest`] and [`WireResponse`] are the top-level frames
//! used by the TCP transport: every frame on a connection is a
//! length-prefixed bincode encoding of one of them.

use {
    crate::{
        error::{Result, TransportError},
        peer::PeerAddress,
    },
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::fmt,
};

// ── Log entries ─────────────────────────────────────────────────────────────

/// What a replicated log entry carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogKind {
    /// An application command for the state machine.
    Command,
    /// Leader assertion entry written at the start of a term.
    Noop,
    /// Membership change: add a peer.
    AddPeer,
    /// Membership change: remove a peer.
    RemovePeer,
    /// Barrier used to wait until all preceding entries are applied.
    Barrier,
}

/// A single entry of the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the log.
    pub index: u64,
    /// Term in which the entry was created.
    pub term: u64,
    /// Entry type.
    pub kind: LogKind,
    /// Opaque payload.
    pub data: Vec<u8>,
}

// ── Request / response payloads ─────────────────────────────────────────────

/// Sent by a candidate to solicit a vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: u64,
    /// Candidate requesting the vote.
    pub candidate: PeerAddress,
    /// Index of the candidate's last log entry.
    pub last_log_index: u64,
    /// Term of the candidate's last log entry.
    pub last_log_term: u64,
}

/// Reply to [`RequestVoteRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself.
    pub term: u64,
    /// Voter's view of the cluster, so a removed node can learn it.
    pub peers: Vec<PeerAddress>,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// Sent by the leader to replicate entries or as a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: u64,
    /// Leader identity, so followers can redirect clients.
    pub leader: PeerAddress,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_entry: u64,
    /// Term of `prev_log_entry`.
    pub prev_log_term: u64,
    /// New entries; empty for heartbeats.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit_index: u64,
}

/// Reply to [`AppendEntriesRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Follower's current term.
    pub term: u64,
    /// Follower's last log index, a hint for faster catch-up.
    pub last_log: u64,
    /// Whether the entries were accepted.
    pub success: bool,
    /// Set when a failure is not worth backing off for.
    pub no_retry_backoff: bool,
}

/// Sent by the leader to push a snapshot to a lagging follower.
///
/// The snapshot bytes themselves travel out of band as a byte stream of
/// exactly `size` bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: u64,
    /// Leader identity.
    pub leader: PeerAddress,
    /// Last index covered by the snapshot.
    pub last_log_index: u64,
    /// Term of `last_log_index`.
    pub last_log_term: u64,
    /// Peer set at the time of the snapshot.
    pub peers: Vec<PeerAddress>,
    /// Encoded cluster configuration.
    pub configuration: Vec<u8>,
    /// Log index at which `configuration` was committed.
    pub configuration_index: u64,
    /// Size of the attached snapshot stream in bytes.
    pub size: u64,
}

/// Reply to [`InstallSnapshotRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    /// Follower's current term.
    pub term: u64,
    /// Whether the snapshot was installed.
    pub success: bool,
}

// ── RPC kind ────────────────────────────────────────────────────────────────

/// The three RPCs that drive election and replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    /// Log replication / heartbeat.
    AppendEntries,
    /// Leader election.
    RequestVote,
    /// Snapshot transfer.
    InstallSnapshot,
}

impl RpcKind {
    /// Stable tag for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AppendEntries => "append_entries",
            Self::RequestVote => "request_vote",
            Self::InstallSnapshot => "install_snapshot",
        }
    }
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Wire frames ─────────────────────────────────────────────────────────────

/// Request body on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireCommand {
    /// See [`AppendEntriesRequest`].
    AppendEntries(AppendEntriesRequest),
    /// See [`RequestVoteRequest`].
    RequestVote(RequestVoteRequest),
    /// See [`InstallSnapshotRequest`]; followed by `size` raw bytes.
    InstallSnapshot(InstallSnapshotRequest),
}

impl WireCommand {
    /// Which RPC this is.
    pub fn kind(&self) -> RpcKind {
        match self {
            Self::AppendEntries(_) => RpcKind::AppendEntries,
            Self::RequestVote(_) => RpcKind::RequestVote,
            Self::InstallSnapshot(_) => RpcKind::InstallSnapshot,
        }
    }
}

/// One request frame.  `id` correlates the matching [`WireResponse`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireRequest {
    /// Per-connection request id.
    pub id: u64,
    /// The RPC.
    pub command: WireCommand,
}

/// Response body on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireReply {
    /// See [`AppendEntriesResponse`].
    AppendEntries(AppendEntriesResponse),
    /// See [`RequestVoteResponse`].
    RequestVote(RequestVoteResponse),
    /// See [`InstallSnapshotResponse`].
    InstallSnapshot(InstallSnapshotResponse),
    /// The remote handler failed; carries its error text.
    Error(String),
}

impl WireReply {
    /// Tag for logging and mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AppendEntries(_) => RpcKind::AppendEntries.as_str(),
            Self::RequestVote(_) => RpcKind::RequestVote.as_str(),
            Self::InstallSnapshot(_) => RpcKind::InstallSnapshot.as_str(),
            Self::Error(_) => "error",
        }
    }
}

/// One response frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireResponse {
    /// Id of the request this answers.
    pub id: u64,
    /// Outcome of the remote handler.
    pub reply: WireReply,
}

// ── Framing helpers ─────────────────────────────────────────────────────────

/// Serialize `msg` with a 4-byte little-endian length prefix.
///
/// Wire format: `[len: u32-le][payload: len bytes]`
pub fn encode_frame<T: Serialize>(msg: &T, max_size: usize) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > max_size || payload.len() > u32::MAX as usize {
        return Err(TransportError::MessageTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4usize.saturating_add(payload.len()));
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a frame payload (without its length prefix).
pub fn decode_frame<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(TransportError::Serialization)
}

/// Read the length prefix from a 4-byte buffer.
pub fn read_frame_len(header: &[u8; 4]) -> usize {
    u32::from_le_bytes(*header) as usize
}

// ── Tests ───────────────────────────────────────────────────────────────────
