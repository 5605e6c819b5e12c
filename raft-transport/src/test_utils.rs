//! Fixtures shared by the unit tests.

use {
    crate::{
        error::TransportError,
        message::{
            AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotResponse, LogEntry,
            LogKind, RequestVoteRequest, RequestVoteResponse,
        },
        peer::PeerAddress,
        rpc::{Rpc, RpcConsumer},
    },
    tokio::io::AsyncReadExt,
};

/// Initialize env_logger once for test output.
pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

pub fn append_request(prev: u64) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term: 4,
        leader: PeerAddress::new("leader"),
        prev_log_entry: prev,
        prev_log_term: 4,
        entries: vec![LogEntry {
            index: prev.saturating_add(1),
            term: 4,
            kind: LogKind::Command,
            data: vec![1, 2, 3],
        }],
        leader_commit_index: prev,
    }
}

pub fn vote_request(term: u64, last_log_index: u64) -> RequestVoteRequest {
    RequestVoteRequest {
        term,
        candidate: PeerAddress::new("candidate"),
        last_log_index,
        last_log_term: term.saturating_sub(1),
    }
}

/// Serve `consumer` with a well-behaved follower:
/// appends succeed with `last_log = prev_log_entry + 1`, votes are granted
/// when `last_log_index >= 10`, snapshots succeed when the stream length
/// matches the declared size.
pub fn spawn_follower(consumer: RpcConsumer) {
    tokio::spawn(async move {
        while let Some(rpc) = consumer.recv().await {
            match rpc {
                Rpc::AppendEntries { request, responder } => {
                    responder.respond(Ok(AppendEntriesResponse {
                        term: request.term,
                        last_log: request.prev_log_entry.saturating_add(1),
                        success: true,
                        no_retry_backoff: false,
                    }))
                }
                Rpc::RequestVote { request, responder } => {
                    responder.respond(Ok(RequestVoteResponse {
                        term: request.term,
                        peers: vec![],
                        granted: request.last_log_index >= 10,
                    }))
                }
                Rpc::InstallSnapshot {
                    request,
                    mut data,
                    responder,
                } => {
                    let mut buf = Vec::new();
                    let read = data.read_to_end(&mut buf).await;
                    responder.respond(match read {
                        Ok(n) => Ok(InstallSnapshotResponse {
                            term: request.term,
                            success: n as u64 == request.size,
                        }),
                        Err(e) => Err(TransportError::remote(e.to_string())),
                    })
                }
            }
        }
    });
}
