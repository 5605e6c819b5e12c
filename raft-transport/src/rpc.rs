//! Inbound RPC envelope and its one-shot reply path.
//!
//! Every RPC that reaches this node is delivered to the consensus engine as
//! an [`Rpc`] on the transport's [`RpcConsumer`].  Each variant owns a typed
//! [`Responder`]; answering consumes it, so a second reply cannot be
//! written.  Dropping a responder without answering is a handler bug: it is
//! logged and the caller sees [`TransportError::NoReply`].

use {
    crate::{
        error::{Result, TransportError},
        message::{
            AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
            InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse, RpcKind,
        },
        peer::PeerAddress,
    },
    log::{debug, error, warn},
    std::{fmt, future::Future, sync::Arc, time::Duration},
    tokio::{
        io::AsyncRead,
        sync::{mpsc, oneshot, Mutex},
    },
};

/// Snapshot bytes attached to an install-snapshot RPC.
///
/// The handler must read it to the end before responding.
pub type SnapshotReader = Box<dyn AsyncRead + Send + Unpin>;

/// Receiving half of a [`Responder`].
pub(crate) type ReplyReceiver<T> = oneshot::Receiver<Result<T>>;

/// Write-once reply channel for a single RPC.
pub struct Responder<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
    kind: RpcKind,
}

impl<T> Responder<T> {
    pub(crate) fn channel(kind: RpcKind) -> (Self, ReplyReceiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx), kind }, rx)
    }

    /// Send the handler's outcome back to the caller.
    ///
    /// If the caller already gave up (timeout, shutdown) the reply is
    /// discarded.
    pub fn respond(mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            if tx.send(result).is_err() {
                debug!("discarding late {} reply, caller is gone", self.kind);
            }
        }
    }

    /// Which RPC this responder answers.
    pub fn kind(&self) -> RpcKind {
        self.kind
    }
}

impl<T> Drop for Responder<T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            error!("{} handler dropped rpc without responding", self.kind);
        }
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("kind", &self.kind)
            .field("answered", &self.tx.is_none())
            .finish()
    }
}

/// An inbound RPC awaiting a reply from the consensus engine.
pub enum Rpc {
    /// Log replication or heartbeat from the leader.
    AppendEntries {
        /// The leader's request.
        request: AppendEntriesRequest,
        /// Where the answer goes.
        responder: Responder<AppendEntriesResponse>,
    },
    /// Vote solicitation from a candidate.
    RequestVote {
        /// The candidate's request.
        request: RequestVoteRequest,
        /// Where the answer goes.
        responder: Responder<RequestVoteResponse>,
    },
    /// Snapshot push from the leader.
    InstallSnapshot {
        /// Snapshot metadata.
        request: InstallSnapshotRequest,
        /// Exactly `request.size` bytes of snapshot data.
        data: SnapshotReader,
        /// Where the answer goes.
        responder: Responder<InstallSnapshotResponse>,
    },
}

impl Rpc {
    /// Which RPC this is.
    pub fn kind(&self) -> RpcKind {
        match self {
            Self::AppendEntries { .. } => RpcKind::AppendEntries,
            Self::RequestVote { .. } => RpcKind::RequestVote,
            Self::InstallSnapshot { .. } => RpcKind::InstallSnapshot,
        }
    }

    /// Answer with an error regardless of the kind.
    pub fn reject(self, err: TransportError) {
        match self {
            Self::AppendEntries { responder, .. } => responder.respond(Err(err)),
            Self::RequestVote { responder, .. } => responder.respond(Err(err)),
            Self::InstallSnapshot { responder, .. } => responder.respond(Err(err)),
        }
    }
}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppendEntries { request, .. } => {
                f.debug_tuple("AppendEntries").field(request).finish()
            }
            Self::RequestVote { request, .. } => f.debug_tuple("RequestVote").field(request).finish(),
            Self::InstallSnapshot { request, .. } => {
                f.debug_tuple("InstallSnapshot").field(request).finish()
            }
        }
    }
}

/// The inbound side of a transport, shared by every handler task.
///
/// Cloning is cheap; clones pull from the same queue, so the engine can
/// consume on one task or fan out across several.
#[derive(Clone)]
pub struct RpcConsumer {
    rx: Arc<Mutex<mpsc::Receiver<Rpc>>>,
}

impl RpcConsumer {
    /// Wait for the next inbound RPC.
    ///
    /// Returns `None` once the transport has been dropped.
    pub async fn recv(&self) -> Option<Rpc> {
        self.rx.lock().await.recv().await
    }

    /// Take an RPC if one is already queued.
    pub fn try_recv(&self) -> Option<Rpc> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// Create the inbound queue for a transport.
pub(crate) fn rpc_channel(capacity: usize) -> (mpsc::Sender<Rpc>, RpcConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        RpcConsumer {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Wait for the reply to an outbound RPC.
///
/// A responder dropped without answering surfaces as
/// [`TransportError::NoReply`].
pub(crate) async fn recv_reply<T>(rx: ReplyReceiver<T>) -> Result<T> {
    rx.await.unwrap_or(Err(TransportError::NoReply))
}

/// Run an outbound call under the transport deadline.
///
/// On timeout the call future, and with it the reply receiver, is dropped,
/// so a reply that shows up later is discarded by [`Responder::respond`].
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    kind: RpcKind,
    target: &PeerAddress,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} to {} timed out after {:?}", kind, target, deadline);
            Err(TransportError::Timeout(deadline.as_millis() as u64))
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
