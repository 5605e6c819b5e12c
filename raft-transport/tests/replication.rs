//! End-to-end replication scenarios over the in-process and TCP transports.

use {
    raft_transport::{
        message::{
            AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
            InstallSnapshotResponse, LogEntry, LogKind, RequestVoteRequest, RequestVoteResponse,
        },
        InmemTransport, NetworkTransport, PeerAddress, PipelineState, Rpc, RpcConsumer,
        Transport, TransportConfig, TransportError,
    },
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{io::AsyncReadExt, sync::mpsc},
};

/// Initialize env_logger once for test output.
fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

fn append(term: u64, prev: u64, n: usize) -> AppendEntriesRequest {
    let entries = (0..n as u64)
        .map(|i| LogEntry {
            index: prev.saturating_add(i).saturating_add(1),
            term,
            kind: LogKind::Command,
            data: format!("cmd-{}", prev.saturating_add(i)).into_bytes(),
        })
        .collect();
    AppendEntriesRequest {
        term,
        leader: PeerAddress::new("leader"),
        prev_log_entry: prev,
        prev_log_term: term,
        entries,
        leader_commit_index: prev,
    }
}

/// A follower that appends everything it receives and answers with its
/// new last index.
fn run_follower(consumer: RpcConsumer) {
    tokio::spawn(async move {
        let mut last_log = 0u64;
        while let Some(rpc) = consumer.recv().await {
            match rpc {
                Rpc::AppendEntries { request, responder } => {
                    if let Some(entry) = request.entries.last() {
                        last_log = last_log.max(entry.index);
                    }
                    responder.respond(Ok(AppendEntriesResponse {
                        term: request.term,
                        last_log,
                        success: true,
                        no_retry_backoff: false,
                    }));
                }
                Rpc::RequestVote { request, responder } => {
                    responder.respond(Ok(RequestVoteResponse {
                        term: request.term,
                        peers: vec![],
                        granted: request.last_log_index >= last_log,
                    }));
                }
                other => other.reject(TransportError::remote("unsupported")),
            }
        }
    });
}

fn cluster(names: &[&str]) -> Vec<InmemTransport> {
    let nodes: Vec<InmemTransport> = names
        .iter()
        .map(|name| InmemTransport::new(*name, TransportConfig::dev_default()))
        .collect();
    for a in &nodes {
        for b in &nodes {
            if a.local_addr() != b.local_addr() {
                a.connect(b.local_addr(), b);
            }
        }
    }
    nodes
}

#[tokio::test]
async fn leader_replicates_to_followers_through_pipelines() {
    init_logging();
    let nodes = cluster(&["leader", "f1", "f2"]);
    let leader = &nodes[0];
    for follower in &nodes[1..] {
        run_follower(follower.consumer());
    }

    let mut tasks = Vec::new();
    for follower in &nodes[1..] {
        let mut pipeline = leader
            .append_entries_pipeline(&follower.local_addr())
            .await
            .unwrap();
        let mut completions = pipeline.completions().unwrap();
        tasks.push(tokio::spawn(async move {
            let drain = tokio::spawn(async move {
                let mut progress = Vec::new();
                while let Some(fut) = completions.recv().await {
                    progress.push(fut.response().unwrap().last_log);
                    if progress.len() == 40 {
                        break;
                    }
                }
                progress
            });
            for batch in 0..40u64 {
                pipeline
                    .append_entries(append(1, batch.saturating_mul(3), 3))
                    .await
                    .unwrap();
            }
            drain.await.unwrap()
        }));
    }

    for task in tasks {
        let progress = task.await.unwrap();
        let expected: Vec<u64> = (1..=40u64).map(|b| b.saturating_mul(3)).collect();
        assert_eq!(progress, expected);
    }
}

#[tokio::test]
async fn window_of_two_blocks_third_submission() {
    init_logging();
    let config = TransportConfig {
        max_pipeline_window: 2,
        ..TransportConfig::dev_default()
    };
    let leader = InmemTransport::new("leader", config.clone());
    let follower = InmemTransport::new("follower", config);
    leader.connect("follower", &follower);

    // The follower parks every request until the test releases it.
    let (parked_tx, mut parked_rx) = mpsc::unbounded_channel();
    let consumer = follower.consumer();
    tokio::spawn(async move {
        while let Some(rpc) = consumer.recv().await {
            let _ = parked_tx.send(rpc);
        }
    });
    let answer = |rpc: Rpc| {
        if let Rpc::AppendEntries { request, responder } = rpc {
            responder.respond(Ok(AppendEntriesResponse {
                term: request.term,
                last_log: request.prev_log_entry.saturating_add(1),
                success: true,
                no_retry_backoff: false,
            }));
        }
    };

    let mut pipeline = leader
        .append_entries_pipeline(&PeerAddress::new("follower"))
        .await
        .unwrap();
    let mut completions = pipeline.completions().unwrap();
    let pipeline = Arc::new(pipeline);

    pipeline.append_entries(append(1, 0, 1)).await.unwrap();
    pipeline.append_entries(append(1, 1, 1)).await.unwrap();

    let third_done = Arc::new(AtomicBool::new(false));
    let submitter = {
        let pipeline = pipeline.clone();
        let third_done = third_done.clone();
        tokio::spawn(async move {
            let fut = pipeline.append_entries(append(1, 2, 1)).await;
            third_done.store(true, Ordering::SeqCst);
            fut
        })
    };

    let first = parked_rx.recv().await.unwrap();
    let second = parked_rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!third_done.load(Ordering::SeqCst));

    answer(first);
    submitter.await.unwrap().unwrap();
    assert!(third_done.load(Ordering::SeqCst));

    answer(second);
    answer(parked_rx.recv().await.unwrap());

    for expected in 1..=3u64 {
        let fut = tokio::time::timeout(Duration::from_secs(2), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fut.response().unwrap().last_log, expected);
    }
}

#[tokio::test]
async fn close_cancels_outstanding_and_is_idempotent() {
    init_logging();
    let nodes = cluster(&["leader", "follower"]);
    // No follower loop: requests stay in flight.
    let mut pipeline = nodes[0]
        .append_entries_pipeline(&nodes[1].local_addr())
        .await
        .unwrap();
    let mut completions = pipeline.completions().unwrap();

    let futures = vec![
        pipeline.append_entries(append(2, 0, 1)).await.unwrap(),
        pipeline.append_entries(append(2, 1, 1)).await.unwrap(),
    ];
    pipeline.close().unwrap();
    pipeline.close().unwrap();

    for fut in &futures {
        assert!(matches!(fut.wait().await, Err(TransportError::Cancelled)));
    }
    assert!(matches!(
        pipeline.append_entries(append(2, 2, 1)).await,
        Err(TransportError::PipelineClosed)
    ));
    assert!(completions.recv().await.is_none());
    assert_eq!(pipeline.state(), PipelineState::Closed);
}

#[tokio::test]
async fn snapshot_is_drained_before_reply_over_tcp() {
    init_logging();
    let leader = NetworkTransport::bind(TransportConfig::dev_default())
        .await
        .unwrap();
    let follower = NetworkTransport::bind(TransportConfig::dev_default())
        .await
        .unwrap();
    let data = vec![7u8; 1_000_000];

    let consumer = follower.consumer();
    tokio::spawn(async move {
        if let Some(Rpc::InstallSnapshot {
            request,
            mut data,
            responder,
        }) = consumer.recv().await
        {
            let mut received = Vec::new();
            let read = data.read_to_end(&mut received).await;
            let drained = matches!(read, Ok(n) if n as u64 == request.size)
                && received.iter().all(|b| *b == 7);
            responder.respond(Ok(InstallSnapshotResponse {
                term: request.term,
                success: drained,
            }));
        }
    });

    let resp = leader
        .install_snapshot(
            &follower.local_addr(),
            InstallSnapshotRequest {
                term: 9,
                leader: leader.local_addr(),
                last_log_index: 1_000,
                last_log_term: 8,
                peers: vec![leader.local_addr(), follower.local_addr()],
                configuration: vec![],
                configuration_index: 0,
                size: data.len() as u64,
            },
            Box::new(std::io::Cursor::new(data)),
        )
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.term, 9);
}

#[tokio::test]
async fn vote_round_over_tcp() {
    init_logging();
    let candidate = NetworkTransport::bind(TransportConfig::dev_default())
        .await
        .unwrap();
    let voters = [
        NetworkTransport::bind(TransportConfig::dev_default())
            .await
            .unwrap(),
        NetworkTransport::bind(TransportConfig::dev_default())
            .await
            .unwrap(),
    ];
    for voter in &voters {
        run_follower(voter.consumer());
    }

    let mut granted = Vec::new();
    for voter in &voters {
        let resp = candidate
            .request_vote(
                &voter.local_addr(),
                RequestVoteRequest {
                    term: 2,
                    candidate: candidate.local_addr(),
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap();
        granted.push(resp.granted);
    }
    assert_eq!(granted, vec![true, true]);

    // Peer identities survive a trip through storage.
    for voter in &voters {
        let stored = candidate.encode_peer(&voter.local_addr());
        assert_eq!(candidate.decode_peer(&stored).unwrap(), voter.local_addr());
    }
}
