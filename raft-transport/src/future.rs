//! Handle to one pipelined append-entries request.

use {
    crate::{
        error::{Result, TransportError},
        message::{AppendEntriesRequest, AppendEntriesResponse},
    },
    std::{
        fmt,
        sync::{Arc, OnceLock},
        time::Instant,
    },
    tokio::sync::Notify,
};

struct FutureInner {
    seq: u64,
    start: Instant,
    request: Arc<AppendEntriesRequest>,
    result: OnceLock<Result<AppendEntriesResponse>>,
    resolved: Notify,
}

/// Result of a request submitted to an
/// [`AppendPipeline`](crate::pipeline::AppendPipeline).
///
/// Clones refer to the same request.  The outcome is set exactly once,
/// either by the network layer or by the pipeline being closed, and never
/// changes afterwards.
#[derive(Clone)]
pub struct AppendFuture {
    inner: Arc<FutureInner>,
}

impl AppendFuture {
    pub(crate) fn new(seq: u64, request: Arc<AppendEntriesRequest>) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                seq,
                start: Instant::now(),
                request,
                result: OnceLock::new(),
                resolved: Notify::new(),
            }),
        }
    }

    /// Position of this request in its pipeline's submission order.
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    /// When the request was submitted.
    pub fn start(&self) -> Instant {
        self.inner.start
    }

    /// The request as submitted.
    pub fn request(&self) -> &AppendEntriesRequest {
        &self.inner.request
    }

    /// The follower's response, once resolved successfully.
    pub fn response(&self) -> Option<&AppendEntriesResponse> {
        self.inner.result.get()?.as_ref().ok()
    }

    /// The failure, once resolved unsuccessfully.
    pub fn error(&self) -> Option<&TransportError> {
        self.inner.result.get()?.as_ref().err()
    }

    /// Whether an outcome has been set.
    pub fn is_resolved(&self) -> bool {
        self.inner.result.get().is_some()
    }

    /// Wait until the request is resolved and borrow its outcome.
    pub async fn wait(&self) -> std::result::Result<&AppendEntriesResponse, &TransportError> {
        loop {
            let notified = self.inner.resolved.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent resolve is not missed.
            notified.as_mut().enable();
            if let Some(result) = self.inner.result.get() {
                return result.as_ref();
            }
            notified.await;
        }
    }

    /// Set the outcome.  Returns `false` if one was already set, in which
    /// case `result` is dropped.
    pub(crate) fn resolve(&self, result: Result<AppendEntriesResponse>) -> bool {
        if self.inner.result.set(result).is_err() {
            return false;
        }
        self.inner.resolved.notify_waiters();
        true
    }
}

impl fmt::Debug for AppendFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendFuture")
            .field("seq", &self.inner.seq)
            .field("start", &self.inner.start)
            .field("result", &self.inner.result.get())
            .finish()
    }
}
