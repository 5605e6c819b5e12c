//! TCP transport for raft RPCs.
//!
//! ## Wire format
//!
//! Every frame is length-prefixed:
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: bincode payload]
//! ```
//!
//! Clients send [`WireRequest`] frames and read back [`WireResponse`]
//! frames.  An install-snapshot request frame is followed by exactly
//! `size` raw snapshot bytes.  The server handles one request at a time
//! per connection, so responses come back in request order.
//!
//! Blocking calls borrow a pooled connection per peer.  Pipelines get a
//! dedicated connection with a writer task and a reader task that matches
//! responses to requests by id.

use {
    crate::{
        config::TransportConfig,
        error::{Result, TransportError},
        message::{
            decode_frame, encode_frame, read_frame_len, AppendEntriesRequest,
            AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
            RequestVoteRequest, RequestVoteResponse, RpcKind, WireCommand, WireReply,
            WireRequest, WireResponse,
        },
        peer::PeerAddress,
        pipeline::{AppendPipeline, PipelineCloser, PipelineDispatch},
        rpc::{recv_reply, rpc_channel, with_deadline, Responder, Rpc, RpcConsumer, SnapshotReader},
        transport::Transport,
    },
    async_trait::async_trait,
    dashmap::DashMap,
    futures::future::BoxFuture,
    log::{debug, error, info, warn},
    serde::{de::DeserializeOwned, Serialize},
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, PoisonError,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpListener, TcpStream,
        },
        sync::{mpsc, oneshot, watch},
        task::AbortHandle,
    },
};

/// Buffer between the socket and a handler reading snapshot data.
const SNAPSHOT_PIPE_CAPACITY: usize = 65_536;

// ── Framing ─────────────────────────────────────────────────────────────────

/// Write one length-prefixed frame.
async fn write_frame<W, T>(writer: &mut W, msg: &T, max_message_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg, max_message_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.  Returns `None` on a clean EOF before
/// the header.
async fn read_frame<R, T>(reader: &mut R, max_message_size: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    // 1. Read the 4-byte length prefix.
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = read_frame_len(&header);
    if len > max_message_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_message_size,
        });
    }

    // 2. Read the payload.
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    // 3. Deserialize.
    decode_frame(&payload).map(Some)
}

/// Response types that can be pulled out of a [`WireReply`].
trait FromWireReply: Sized {
    const KIND: RpcKind;
    fn from_wire(reply: WireReply) -> Option<Self>;
}

impl FromWireReply for AppendEntriesResponse {
    const KIND: RpcKind = RpcKind::AppendEntries;
    fn from_wire(reply: WireReply) -> Option<Self> {
        match reply {
            WireReply::AppendEntries(resp) => Some(resp),
            _ => None,
        }
    }
}

impl FromWireReply for RequestVoteResponse {
    const KIND: RpcKind = RpcKind::RequestVote;
    fn from_wire(reply: WireReply) -> Option<Self> {
        match reply {
            WireReply::RequestVote(resp) => Some(resp),
            _ => None,
        }
    }
}

impl FromWireReply for InstallSnapshotResponse {
    const KIND: RpcKind = RpcKind::InstallSnapshot;
    fn from_wire(reply: WireReply) -> Option<Self> {
        match reply {
            WireReply::InstallSnapshot(resp) => Some(resp),
            _ => None,
        }
    }
}

fn unwrap_reply<T: FromWireReply>(reply: WireReply) -> Result<T> {
    if let WireReply::Error(reason) = reply {
        return Err(TransportError::Remote(reason));
    }
    let got = reply.kind();
    T::from_wire(reply).ok_or(TransportError::UnexpectedResponse {
        expected: T::KIND.as_str(),
        got,
    })
}

fn to_wire<T>(result: Result<T>, wrap: fn(T) -> WireReply) -> WireReply {
    match result {
        Ok(resp) => wrap(resp),
        Err(e) => WireReply::Error(e.wire_reason()),
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

struct NetInner {
    config: TransportConfig,
    local_addr: PeerAddress,
    consumer: RpcConsumer,
    pool: DashMap<PeerAddress, Vec<TcpStream>>,
    pipelines: Mutex<Vec<PipelineCloser>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    listener: AbortHandle,
}

/// Transport that carries raft RPCs over TCP.
#[derive(Clone)]
pub struct NetworkTransport {
    inner: Arc<NetInner>,
}

impl NetworkTransport {
    /// Bind the listener and start accepting peers.
    pub async fn bind(config: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("raft transport listening on {}", local_addr);

        let (consumer_tx, consumer) = rpc_channel(config.channel_buffer_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let max_msg = config.max_message_size;

        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("accepted raft connection from {}", addr);
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(Self::handle_connection(
                            stream,
                            addr,
                            consumer_tx.clone(),
                            max_msg,
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            inner: Arc::new(NetInner {
                config,
                local_addr: PeerAddress::from(local_addr),
                consumer,
                pool: DashMap::new(),
                pipelines: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                shutdown_tx,
                listener: accept.abort_handle(),
            }),
        })
    }

    /// Serve requests from one peer connection until EOF, error or shutdown.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        consumer_tx: mpsc::Sender<Rpc>,
        max_message_size: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        loop {
            let request = tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_frame::<_, WireRequest>(&mut reader, max_message_size) => frame,
            };
            let request = match request {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!("bad request frame from {}: {}", addr, e);
                    break;
                }
            };
            debug!("received {} from {}", request.command.kind(), addr);

            let Some((reply, in_sync)) =
                Self::dispatch_inbound(request.command, &mut reader, &consumer_tx).await
            else {
                info!("inbound queue closed, stopping reader for {}", addr);
                break;
            };
            let response = WireResponse {
                id: request.id,
                reply,
            };
            if let Err(e) = write_frame(&mut writer, &response, max_message_size).await {
                warn!("response write error to {}: {}", addr, e);
                break;
            }
            if !in_sync {
                // Unread snapshot bytes are still on the socket.
                warn!("snapshot stream from {} not fully consumed, closing", addr);
                break;
            }
        }
        debug!("connection from {} closed", addr);
    }

    /// Hand one request to the consensus engine and wait for its answer.
    ///
    /// Returns `None` if the engine stopped consuming.  The flag is `false`
    /// when snapshot bytes were left unread on the connection.
    async fn dispatch_inbound(
        command: WireCommand,
        reader: &mut OwnedReadHalf,
        consumer_tx: &mpsc::Sender<Rpc>,
    ) -> Option<(WireReply, bool)> {
        match command {
            WireCommand::AppendEntries(request) => {
                let (responder, rx) = Responder::channel(RpcKind::AppendEntries);
                Self::deliver(consumer_tx, Rpc::AppendEntries { request, responder }).await?;
                Some((to_wire(recv_reply(rx).await, WireReply::AppendEntries), true))
            }
            WireCommand::RequestVote(request) => {
                let (responder, rx) = Responder::channel(RpcKind::RequestVote);
                Self::deliver(consumer_tx, Rpc::RequestVote { request, responder }).await?;
                Some((to_wire(recv_reply(rx).await, WireReply::RequestVote), true))
            }
            WireCommand::InstallSnapshot(request) => {
                let size = request.size;
                let (pipe_tx, pipe_rx) = tokio::io::duplex(SNAPSHOT_PIPE_CAPACITY);
                let (responder, rx) = Responder::channel(RpcKind::InstallSnapshot);
                let rpc = Rpc::InstallSnapshot {
                    request,
                    data: Box::new(pipe_rx),
                    responder,
                };
                Self::deliver(consumer_tx, rpc).await?;

                // Stream the snapshot into the handler; dropping the pipe
                // writer at the end signals EOF.
                let limited = (&mut *reader).take(size);
                let copy = async move {
                    let mut limited = limited;
                    let mut pipe_tx = pipe_tx;
                    tokio::io::copy(&mut limited, &mut pipe_tx).await
                };
                let (copied, reply) = tokio::join!(copy, recv_reply(rx));
                let in_sync = matches!(copied, Ok(n) if n == size);
                Some((to_wire(reply, WireReply::InstallSnapshot), in_sync))
            }
        }
    }

    async fn deliver(consumer_tx: &mpsc::Sender<Rpc>, rpc: Rpc) -> Option<()> {
        if let Err(mpsc::error::SendError(rpc)) = consumer_tx.send(rpc).await {
            rpc.reject(TransportError::TransportShutdown);
            return None;
        }
        Some(())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::TransportShutdown);
        }
        Ok(())
    }

    /// Dial `target`, bounded by the connect timeout.
    async fn dial(&self, target: &PeerAddress) -> Result<TcpStream> {
        let addr = target.socket_addr()?;
        let stream = tokio::time::timeout(self.inner.config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::unreachable(target, "connect timed out"))?
            .map_err(|e| TransportError::unreachable(target, e))?;
        stream.set_nodelay(true)?;
        debug!("dialed {}", target);
        Ok(stream)
    }

    /// Take a pooled connection to `target` or dial a new one.
    async fn get_conn(&self, target: &PeerAddress) -> Result<TcpStream> {
        let pooled = self
            .inner
            .pool
            .get_mut(target)
            .and_then(|mut conns| conns.pop());
        match pooled {
            Some(stream) => Ok(stream),
            None => self.dial(target).await,
        }
    }

    /// Give a healthy connection back to the pool.
    fn return_conn(&self, target: &PeerAddress, stream: TcpStream) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut conns = self.inner.pool.entry(target.clone()).or_default();
        if conns.len() < self.inner.config.max_pool {
            conns.push(stream);
        }
    }

    /// Number of idle connections pooled for `target`.
    pub fn pooled_connections(&self, target: &PeerAddress) -> usize {
        self.inner.pool.get(target).map_or(0, |conns| conns.len())
    }

    /// One request/response exchange on a pooled connection.
    async fn call<T: FromWireReply>(
        &self,
        target: &PeerAddress,
        command: WireCommand,
        snapshot: Option<(SnapshotReader, u64)>,
        deadline: Duration,
    ) -> Result<T> {
        self.check_open()?;
        let kind = command.kind();
        let max_msg = self.inner.config.max_message_size;
        let id = self.next_id();
        with_deadline(deadline, kind, target, async {
            let mut stream = self.get_conn(target).await?;
            write_frame(&mut stream, &WireRequest { id, command }, max_msg).await?;
            if let Some((data, size)) = snapshot {
                let mut limited = data.take(size);
                let sent = tokio::io::copy(&mut limited, &mut stream).await?;
                if sent != size {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("snapshot stream ended after {sent} of {size} bytes"),
                    )));
                }
                stream.flush().await?;
            }

            let response: WireResponse = read_frame(&mut stream, max_msg)
                .await?
                .ok_or_else(|| TransportError::unreachable(target, "connection closed"))?;
            if response.id != id {
                return Err(TransportError::InvalidPeer(format!(
                    "response id {} does not match request {}",
                    response.id, id
                )));
            }
            self.return_conn(target, stream);
            unwrap_reply(response.reply)
        })
        .await
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn consumer(&self) -> RpcConsumer {
        self.inner.consumer.clone()
    }

    fn local_addr(&self) -> PeerAddress {
        self.inner.local_addr.clone()
    }

    async fn append_entries_pipeline(&self, target: &PeerAddress) -> Result<AppendPipeline> {
        self.check_open()?;
        let stream = self.dial(target).await?;
        let dispatch = NetDispatch::spawn(target.clone(), stream, &self.inner.config);
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
        let deadline = self.inner.config.rpc_timeout();
        self.call(target, WireCommand::AppendEntries(request), None, deadline)
            .await
    }

    async fn request_vote(
        &self,
        target: &PeerAddress,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let deadline = self.inner.config.rpc_timeout();
        self.call(target, WireCommand::RequestVote(request), None, deadline)
            .await
    }

    async fn install_snapshot(
        &self,
        target: &PeerAddress,
        request: InstallSnapshotRequest,
        data: SnapshotReader,
    ) -> Result<InstallSnapshotResponse> {
        let size = request.size;
        let deadline = self.inner.config.snapshot_timeout(size);
        self.call(
            target,
            WireCommand::InstallSnapshot(request),
            Some((data, size)),
            deadline,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.listener.abort();
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.pool.clear();
        let pipelines = std::mem::take(
            &mut *self
                .inner
                .pipelines
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for closer in pipelines {
            closer.close();
        }
        info!("raft transport {} shut down", self.inner.local_addr);
        Ok(())
    }
}

impl Drop for NetInner {
    fn drop(&mut self) {
        self.listener.abort();
        let _ = self.shutdown_tx.send(true);
    }
}

// ── Pipelined connection ────────────────────────────────────────────────────

type PendingReplies = Arc<DashMap<u64, oneshot::Sender<Result<AppendEntriesResponse>>>>;

/// Pipeline dispatcher over a dedicated TCP connection.
struct NetDispatch {
    target: PeerAddress,
    timeout: Duration,
    max_message_size: usize,
    next_id: AtomicU64,
    pending: PendingReplies,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader: AbortHandle,
}

impl NetDispatch {
    fn spawn(target: PeerAddress, stream: TcpStream, config: &TransportConfig) -> Self {
        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let pending = PendingReplies::default();

        tokio::spawn(Self::write_loop(target.clone(), writer, write_rx));
        let reader = tokio::spawn(Self::read_loop(
            target.clone(),
            reader,
            pending.clone(),
            config.max_message_size,
        ));

        Self {
            target,
            timeout: config.rpc_timeout(),
            max_message_size: config.max_message_size,
            next_id: AtomicU64::new(0),
            pending,
            write_tx: Mutex::new(Some(write_tx)),
            reader: reader.abort_handle(),
        }
    }

    /// Write queued frames in order until the queue closes.
    async fn write_loop(
        target: PeerAddress,
        mut writer: OwnedWriteHalf,
        mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                warn!("pipeline write error to {}: {}", target, e);
                return;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Match responses to waiting requests until the connection drops.
    async fn read_loop(
        target: PeerAddress,
        mut reader: OwnedReadHalf,
        pending: PendingReplies,
        max_message_size: usize,
    ) {
        loop {
            match read_frame::<_, WireResponse>(&mut reader, max_message_size).await {
                Ok(Some(response)) => match pending.remove(&response.id) {
                    Some((_, tx)) => {
                        let _ = tx.send(unwrap_reply(response.reply));
                    }
                    None => debug!("dropping reply {} from {}, caller gone", response.id, target),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("pipeline read error from {}: {}", target, e);
                    break;
                }
            }
        }
        Self::fail_pending(&target, &pending);
    }

    fn fail_pending(target: &PeerAddress, pending: &PendingReplies) {
        let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Err(TransportError::unreachable(
                    target,
                    "pipeline connection lost",
                )));
            }
        }
    }
}

impl PipelineDispatch for NetDispatch {
    fn dispatch(
        &self,
        request: Arc<AppendEntriesRequest>,
    ) -> BoxFuture<'static, Result<AppendEntriesResponse>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = WireRequest {
            id,
            command: WireCommand::AppendEntries(AppendEntriesRequest::clone(&request)),
        };
        let frame = match encode_frame(&frame, self.max_message_size) {
            Ok(frame) => frame,
            Err(e) => return Box::pin(futures::future::ready(Err(e))),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let queued = self
            .write_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|write_tx| write_tx.send(frame).is_ok());
        if !queued {
            self.pending.remove(&id);
            return Box::pin(futures::future::ready(Err(TransportError::unreachable(
                &self.target,
                "pipeline connection lost",
            ))));
        }

        let target = self.target.clone();
        let timeout = self.timeout;
        let pending = self.pending.clone();
        Box::pin(async move {
            let result = with_deadline(timeout, RpcKind::AppendEntries, &target, async {
                rx.await.unwrap_or_else(|_| {
                    Err(TransportError::unreachable(&target, "pipeline connection lost"))
                })
            })
            .await;
            pending.remove(&id);
            result
        })
    }

    fn shutdown(&self) {
        self.write_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.reader.abort();
        self.pending.clear();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::test_utils::{append_request, init_logging, spawn_follower, vote_request},
    };

    async fn bind_dev() -> NetworkTransport {
        init_logging();
        NetworkTransport::bind(TransportConfig::dev_default())
            .await
            .unwrap()
    }

    fn snapshot_request(size: u64) -> InstallSnapshotRequest {
        InstallSnapshotRequest {
            term: 6,
            leader: PeerAddress::new("leader"),
            last_log_index: 500,
            last_log_term: 5,
            peers: vec![PeerAddress::new("leader"), PeerAddress::new("follower")],
            configuration: vec![9, 9],
            configuration_index: 480,
            size,
        }
    }

    /// An address nobody is listening on.
    async fn dead_addr() -> PeerAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        PeerAddress::from(addr)
    }

    #[tokio::test]
    async fn test_request_vote_over_tcp() {
        let leader = bind_dev().await;
        let follower = bind_dev().await;
        spawn_follower(follower.consumer());

        let resp = leader
            .request_vote(&follower.local_addr(), vote_request(3, 11))
            .await
            .unwrap();
        assert!(resp.granted);
        assert_eq!(resp.term, 3);

        let resp = leader
            .request_vote(&follower.local_addr(), vote_request(3, 2))
            .await
            .unwrap();
        assert!(!resp.granted);
        assert_eq!(leader.pooled_connections(&follower.local_addr()), 1);
    }

    #[tokio::test]
    async fn test_remote_error_over_tcp() {
        let leader = bind_dev().await;
        let follower = bind_dev().await;
        let consumer = follower.consumer();
        tokio::spawn(async move {
            let rpc = consumer.recv().await.unwrap();
            rpc.reject(TransportError::remote("stale term"));
        });

        let err = leader
            .append_entries(&follower.local_addr(), append_request(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Remote(ref reason) if reason == "stale term"));
    }

    #[tokio::test]
    async fn test_install_snapshot_streams_data() {
        let leader = bind_dev().await;
        let follower = bind_dev().await;
        let snapshot: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let expected = snapshot.clone();

        let consumer = follower.consumer();
        let handler = tokio::spawn(async move {
            let Some(Rpc::InstallSnapshot {
                request,
                mut data,
                responder,
            }) = consumer.recv().await
            else {
                panic!("expected install snapshot");
            };
            let mut received = Vec::new();
            data.read_to_end(&mut received).await.unwrap();
            assert_eq!(received.len() as u64, request.size);
            responder.respond(Ok(InstallSnapshotResponse {
                term: request.term,
                success: true,
            }));
            received
        });

        let resp = leader
            .install_snapshot(
                &follower.local_addr(),
                snapshot_request(snapshot.len() as u64),
                Box::new(std::io::Cursor::new(snapshot)),
            )
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(handler.await.unwrap(), expected);

        // The connection stayed in sync and can be reused.
        spawn_follower(follower.consumer());
        assert!(leader
            .append_entries(&follower.local_addr(), append_request(2))
            .await
            .unwrap()
            .success);
    }

    #[tokio::test]
    async fn test_short_snapshot_stream_fails() {
        let leader = bind_dev().await;
        let follower = bind_dev().await;
        spawn_follower(follower.consumer());

        let err = leader
            .install_snapshot(
                &follower.local_addr(),
                snapshot_request(1_000),
                Box::new(std::io::Cursor::new(vec![0u8; 10])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn test_timeout_discards_late_reply() {
        init_logging();
        let config = TransportConfig {
            rpc_timeout_ms: 100,
            ..TransportConfig::dev_default()
        };
        let leader = NetworkTransport::bind(config).await.unwrap();
        let follower = bind_dev().await;

        let consumer = follower.consumer();
        let (held_tx, held_rx) = oneshot::channel();
        tokio::spawn(async move {
            // Sit on the first request past the caller's deadline.
            let rpc = consumer.recv().await.unwrap();
            let _ = held_tx.send(rpc);
        });

        let err = leader
            .append_entries(&follower.local_addr(), append_request(0))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(100)));
        assert_eq!(leader.pooled_connections(&follower.local_addr()), 0);

        // Answer late; the caller is gone and the connection was discarded.
        if let Rpc::AppendEntries { request, responder } = held_rx.await.unwrap() {
            responder.respond(Ok(AppendEntriesResponse {
                term: request.term,
                last_log: 1,
                success: true,
                no_retry_backoff: false,
            }));
        }

        spawn_follower(follower.consumer());
        let resp = leader
            .append_entries(&follower.local_addr(), append_request(7))
            .await
            .unwrap();
        assert_eq!(resp.last_log, 8);
    }

    #[tokio::test]
    async fn test_dead_peer_is_unreachable() {
        let leader = bind_dev().await;
        let target = dead_addr().await;

        let err = leader
            .request_vote(&target, vote_request(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
        assert!(err.is_retryable());
        assert!(matches!(
            leader.append_entries_pipeline(&target).await,
            Err(TransportError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_pipeline_over_tcp() {
        let leader = bind_dev().await;
        let follower = bind_dev().await;
        spawn_follower(follower.consumer());

        let mut pipeline = leader
            .append_entries_pipeline(&follower.local_addr())
            .await
            .unwrap();
        let mut completions = pipeline.completions().unwrap();

        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(fut) = completions.recv().await {
                seen.push(fut.response().map(|resp| resp.last_log));
                if seen.len() == 50 {
                    break;
                }
            }
            seen
        });
        for prev in 0..50 {
            pipeline.append_entries(append_request(prev)).await.unwrap();
        }

        let seen = consumer.await.unwrap();
        let expected: Vec<Option<u64>> = (1..=50).map(Some).collect();
        assert_eq!(seen, expected);
        pipeline.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_shuts_transport() {
        let leader = bind_dev().await;
        let follower = bind_dev().await;
        spawn_follower(follower.consumer());

        let pipeline = leader
            .append_entries_pipeline(&follower.local_addr())
            .await
            .unwrap();
        leader.close().await.unwrap();
        leader.close().await.unwrap();

        assert!(matches!(
            pipeline.append_entries(append_request(0)).await,
            Err(TransportError::PipelineClosed)
        ));
        assert!(matches!(
            leader
                .request_vote(&follower.local_addr(), vote_request(1, 0))
                .await,
            Err(TransportError::TransportShutdown)
        ));
    }

    #[test]
    fn test_unwrap_reply_kinds() {
        let reply = WireReply::RequestVote(RequestVoteResponse {
            term: 1,
            peers: vec![],
            granted: false,
        });
        let err = unwrap_reply::<AppendEntriesResponse>(reply).unwrap_err();
        assert!(matches!(
            err,
            TransportError::UnexpectedResponse {
                expected: "append_entries",
                got: "request_vote",
            }
        ));
        assert!(matches!(
            unwrap_reply::<AppendEntriesResponse>(WireReply::Error("nope".into())),
            Err(TransportError::Remote(_))
        ));
    }
}
