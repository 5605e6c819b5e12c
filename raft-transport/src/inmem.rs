//! In-process transport.
//!
//! Nodes living in the same process are wired together explicitly with
//! [`InmemTransport::connect`].  RPCs go straight into the target's inbound
//! queue, so the only latency is scheduling.  Used for tests and for
//! embedding several replicas in one binary.

use {
    crate::{
        config::TransportConfig,
        error::{Result, TransportError},
        message::{
            AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
            InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse, RpcKind,
        },
        peer::PeerAddress,
        pipeline::{AppendPipeline, PipelineCloser, PipelineDispatch},
        rpc::{recv_reply, rpc_channel, with_deadline, Responder, Rpc, RpcConsumer, SnapshotReader},
        transport::Transport,
    },
    async_trait::async_trait,
    dashmap::DashMap,
    futures::future::BoxFuture,
    log::{debug, info},
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, PoisonError, Weak,
        },
        time::Duration,
    },
    tokio::sync::mpsc,
};

struct InmemInner {
    local_addr: PeerAddress,
    config: TransportConfig,
    consumer_tx: mpsc::Sender<Rpc>,
    consumer: RpcConsumer,
    peers: DashMap<PeerAddress, Weak<InmemInner>>,
    pipelines: Mutex<Vec<PipelineCloser>>,
    shutdown: AtomicBool,
}

/// Transport that delivers RPCs between transports in the same process.
///
/// Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct InmemTransport {
    inner: Arc<InmemInner>,
}

impl InmemTransport {
    /// Create a node reachable as `local_addr` once peers connect to it.
    pub fn new(local_addr: impl Into<PeerAddress>, config: TransportConfig) -> Self {
        let (consumer_tx, consumer) = rpc_channel(config.channel_buffer_size);
        Self {
            inner: Arc::new(InmemInner {
                local_addr: local_addr.into(),
                config,
                consumer_tx,
                consumer,
                peers: DashMap::new(),
                pipelines: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Route RPCs addressed to `addr` to `peer`.
    ///
    /// One-directional: `peer` must connect back to reach this node.
    pub fn connect(&self, addr: impl Into<PeerAddress>, peer: &InmemTransport) {
        let addr = addr.into();
        debug!("{} connected to {}", self.inner.local_addr, addr);
        self.inner.peers.insert(addr, Arc::downgrade(&peer.inner));
    }

    /// Forget `addr` and close every pipeline to it.
    pub fn disconnect(&self, addr: &PeerAddress) {
        self.inner.peers.remove(addr);
        self.close_pipelines(|closer| closer.target() == addr);
        debug!("{} disconnected from {}", self.inner.local_addr, addr);
    }

    /// Forget every peer and close every pipeline.
    pub fn disconnect_all(&self) {
        self.inner.peers.clear();
        self.close_pipelines(|_| true);
    }

    fn close_pipelines(&self, matches: impl Fn(&PipelineCloser) -> bool) {
        let mut pipelines = self
            .inner
            .pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pipelines.retain(|closer| {
            if matches(closer) {
                closer.close();
                false
            } else {
                closer.is_live()
            }
        });
    }

    /// Resolve `target` to a live, connected node.
    fn peer(&self, target: &PeerAddress) -> Result<Arc<InmemInner>> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::TransportShutdown);
        }
        let peer = self
            .inner
            .peers
            .get(target)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| TransportError::unreachable(target, "not connected"))?;
        if peer.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::unreachable(target, "peer shut down"));
        }
        Ok(peer)
    }

    /// Deliver one RPC to `target` and wait for its reply.
    async fn make_rpc<T: Send>(
        &self,
        target: &PeerAddress,
        kind: RpcKind,
        deadline: Duration,
        build: impl FnOnce(Responder<T>) -> Rpc + Send,
    ) -> Result<T> {
        let peer = self.peer(target)?;
        with_deadline(deadline, kind, target, async {
            let slot = peer
                .consumer_tx
                .reserve()
                .await
                .map_err(|_| TransportError::unreachable(target, "peer stopped consuming"))?;
            let (responder, rx) = Responder::channel(kind);
            slot.send(build(responder));
            recv_reply(rx).await
        })
        .await
    }
}

#[async_trait]
impl Transport for InmemTransport {
    fn consumer(&self) -> RpcConsumer {
        self.inner.consumer.clone()
    }

    fn local_addr(&self) -> PeerAddress {
        self.inner.local_addr.clone()
    }

    async fn append_entries_pipeline(&self, target: &PeerAddress) -> Result<AppendPipeline> {
        let peer = self.peer(target)?;
        let dispatch = InmemDispatch::spawn(target.clone(), &peer, self.inner.config.rpc_timeout());
        let pipeline = AppendPipeline::new(
            target.clone(),
            self.inner.config.pipeline_window(),
            Box::new(dispatch),
        );
        let mut pipelines = self
            .inner
            .pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pipelines.retain(PipelineCloser::is_live);
        pipelines.push(pipeline.closer());
        Ok(pipeline)
    }

    async fn append_entries(
        &self,
        target: &PeerAddress,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.make_rpc(
            target,
            RpcKind::AppendEntries,
            self.inner.config.rpc_timeout(),
            |responder| Rpc::AppendEntries { request, responder },
        )
        .await
    }

    async fn request_vote(
        &self,
        target: &PeerAddress,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.make_rpc(
            target,
            RpcKind::RequestVote,
            self.inner.config.rpc_timeout(),
            |responder| Rpc::RequestVote { request, responder },
        )
        .await
    }

    async fn install_snapshot(
        &self,
        target: &PeerAddress,
        request: InstallSnapshotRequest,
        data: SnapshotReader,
    ) -> Result<InstallSnapshotResponse> {
        let deadline = self.inner.config.snapshot_timeout(request.size);
        self.make_rpc(target, RpcKind::InstallSnapshot, deadline, |responder| {
            Rpc::InstallSnapshot {
                request,
                data,
                responder,
            }
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.disconnect_all();
        info!("in-memory transport {} shut down", self.inner.local_addr);
        Ok(())
    }
}

/// Pipeline dispatcher that forwards requests to the peer in order.
///
/// A forwarding task owns the ordered queue so `dispatch` never blocks on
/// a full inbound queue at the follower.
struct InmemDispatch {
    target: PeerAddress,
    timeout: Duration,
    forward_tx: Mutex<Option<mpsc::UnboundedSender<Rpc>>>,
    closed: Arc<AtomicBool>,
}

impl InmemDispatch {
    fn spawn(target: PeerAddress, peer: &Arc<InmemInner>, timeout: Duration) -> Self {
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<Rpc>();
        let closed = Arc::new(AtomicBool::new(false));
        let peer = Arc::downgrade(peer);
        let task_closed = closed.clone();
        let task_target = target.clone();
        tokio::spawn(async move {
            while let Some(rpc) = forward_rx.recv().await {
                if task_closed.load(Ordering::Acquire) {
                    rpc.reject(TransportError::Cancelled);
                    continue;
                }
                let Some(peer) = peer.upgrade() else {
                    rpc.reject(TransportError::unreachable(&task_target, "peer dropped"));
                    continue;
                };
                if let Err(mpsc::error::SendError(rpc)) = peer.consumer_tx.send(rpc).await {
                    rpc.reject(TransportError::unreachable(&task_target, "peer stopped consuming"));
                }
            }
            debug!("pipeline forwarder to {} stopped", task_target);
        });
        Self {
            target,
            timeout,
            forward_tx: Mutex::new(Some(forward_tx)),
            closed,
        }
    }
}

impl PipelineDispatch for InmemDispatch {
    fn dispatch(
        &self,
        request: Arc<AppendEntriesRequest>,
    ) -> BoxFuture<'static, Result<AppendEntriesResponse>> {
        let (responder, rx) = Responder::channel(RpcKind::AppendEntries);
        let rpc = Rpc::AppendEntries {
            request: AppendEntriesRequest::clone(&request),
            responder,
        };
        let forward_tx = self.forward_tx.lock().unwrap_or_else(PoisonError::into_inner);
        match forward_tx.as_ref() {
            Some(tx) => {
                if let Err(mpsc::error::SendError(rpc)) = tx.send(rpc) {
                    rpc.reject(TransportError::unreachable(&self.target, "forwarder stopped"));
                }
            }
            None => rpc.reject(TransportError::PipelineClosed),
        }
        drop(forward_tx);

        let target = self.target.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            with_deadline(timeout, RpcKind::AppendEntries, &target, recv_reply(rx)).await
        })
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.forward_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
