//! Pipelined append-entries replication.
//!
//! An [`AppendPipeline`] lets a leader keep many append-entries requests in
//! flight to one follower instead of paying a round trip per batch.
//!
//! 1. **Admission**: each submission takes a permit from a semaphore sized
//!    to the pipeline window.  When the window is full, submitting waits;
//!    that wait is the backpressure.
//! 2. **Dispatch**: the request is handed to the network layer through
//!    [`PipelineDispatch`] while the pipeline lock is held, so requests
//!    reach the wire in submission order.  The reply is awaited on its own
//!    task.
//! 3. **Reordering**: replies may come back in any order.  In-flight
//!    futures sit in a FIFO by sequence number and only the resolved prefix
//!    is released to [`Completions`], so the consumer always sees futures in
//!    submission order.
//! 4. **Close**: new submissions are refused, every unresolved future is
//!    resolved with [`TransportError::Cancelled`] and withheld, and the
//!    completion stream ends once the futures that resolved before the
//!    close have been consumed.

use {
    crate::{
        error::{Result, TransportError},
        future::AppendFuture,
        message::{AppendEntriesRequest, AppendEntriesResponse},
        peer::PeerAddress,
    },
    futures::future::BoxFuture,
    log::{debug, info, warn},
    std::{
        collections::VecDeque,
        sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    },
    tokio::{
        sync::{
            mpsc::{self, error::TrySendError},
            OwnedSemaphorePermit, Semaphore,
        },
        task::AbortHandle,
    },
};

/// The network half of a pipeline, supplied by a transport.
pub trait PipelineDispatch: Send + Sync + 'static {
    /// Put `request` on the wire and return a future for its response.
    ///
    /// Called in submission order with the pipeline lock held, so this must
    /// not block; waiting belongs in the returned future.  The returned
    /// future is responsible for enforcing the RPC deadline.
    fn dispatch(
        &self,
        request: Arc<AppendEntriesRequest>,
    ) -> BoxFuture<'static, Result<AppendEntriesResponse>>;

    /// Release network resources once the pipeline is closed.
    fn shutdown(&self) {}
}

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Accepting submissions.
    Open,
    /// Closed, but futures resolved before the close are still waiting to
    /// be consumed.
    Closing,
    /// Closed and drained.
    Closed,
}

struct InFlight {
    future: AppendFuture,
    task: Option<AbortHandle>,
    // Returned to the gate when the entry is released or cancelled.
    _permit: OwnedSemaphorePermit,
}

struct PipelineInner {
    closed: bool,
    next_seq: u64,
    in_flight: VecDeque<InFlight>,
    completions_tx: Option<mpsc::Sender<AppendFuture>>,
    /// Receiving end until [`AppendPipeline::completions`] takes it.
    completions_rx: Option<mpsc::Receiver<AppendFuture>>,
    /// Released to the completion channel but not yet received.
    released: usize,
}

struct PipelineShared {
    target: PeerAddress,
    gate: Arc<Semaphore>,
    dispatcher: Box<dyn PipelineDispatch>,
    inner: Mutex<PipelineInner>,
}

impl PipelineShared {
    fn lock(&self) -> MutexGuard<'_, PipelineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome for `seq` and release whatever became ready.
    fn complete(&self, seq: u64, result: Result<AppendEntriesResponse>) {
        let mut guard = self.lock();
        if guard.closed {
            debug!(
                "discarding reply for cancelled append {} to {}",
                seq, self.target
            );
            return;
        }
        let Some(front_seq) = guard.in_flight.front().map(|e| e.future.seq()) else {
            warn!("reply for unknown append {} to {}", seq, self.target);
            return;
        };
        let idx = seq.wrapping_sub(front_seq) as usize;
        match guard.in_flight.get_mut(idx) {
            Some(entry) if entry.future.seq() == seq => {
                entry.task = None;
                entry.future.resolve(result);
            }
            _ => {
                warn!("reply for unknown append {} to {}", seq, self.target);
                return;
            }
        }
        Self::release_ready(&mut guard);
    }

    /// Move the resolved prefix of the in-flight queue onto the completion
    /// channel, stopping at the first unresolved future or a full channel.
    fn release_ready(inner: &mut PipelineInner) {
        Self::forward_resolved(inner);
        if inner.closed && inner.in_flight.is_empty() {
            inner.completions_tx = None;
        }
    }

    fn forward_resolved(inner: &mut PipelineInner) {
        while inner
            .in_flight
            .front()
            .is_some_and(|entry| entry.future.is_resolved())
        {
            let Some(tx) = inner.completions_tx.as_ref() else {
                return;
            };
            match tx.try_reserve() {
                Ok(slot) => {
                    if let Some(entry) = inner.in_flight.pop_front() {
                        slot.send(entry.future);
                        inner.released = inner.released.saturating_add(1);
                    }
                }
                Err(TrySendError::Full(())) => return,
                Err(TrySendError::Closed(())) => {
                    // Nobody is listening; release the window anyway.
                    inner.in_flight.pop_front();
                }
            }
        }
    }

    fn close(&self) {
        let mut guard = self.lock();
        if guard.closed {
            return;
        }
        guard.closed = true;
        self.gate.close();

        // A stream nobody took will never be drained.
        if guard.completions_rx.take().is_some() {
            guard.released = 0;
        }

        // Futures that already have their result stay queued for delivery.
        let mut cancelled = 0usize;
        guard.in_flight.retain_mut(|entry| {
            if entry.future.is_resolved() {
                return true;
            }
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            if entry.future.resolve(Err(TransportError::Cancelled)) {
                cancelled = cancelled.saturating_add(1);
            }
            false
        });
        Self::release_ready(&mut guard);
        drop(guard);

        self.dispatcher.shutdown();
        info!(
            "closed append pipeline to {} ({} in-flight requests cancelled)",
            self.target, cancelled
        );
    }

    fn state(&self) -> PipelineState {
        let inner = self.lock();
        if !inner.closed {
            PipelineState::Open
        } else if inner.released == 0 && inner.in_flight.is_empty() {
            PipelineState::Closed
        } else {
            PipelineState::Closing
        }
    }
}

/// Per-peer channel for pipelined append-entries requests.
///
/// Owned by the leader's replication task for one follower.  Submitting
/// and closing may be called from any task; the consumer side is taken
/// once with [`Self::completions`].  A completion stream that was never
/// taken is discarded on close.  Dropping the pipeline closes it.
pub struct AppendPipeline {
    shared: Arc<PipelineShared>,
}

impl AppendPipeline {
    /// Create a pipeline to `target` with at most `window` requests in
    /// flight, sending through `dispatcher`.
    pub fn new(target: PeerAddress, window: usize, dispatcher: Box<dyn PipelineDispatch>) -> Self {
        let window = window.max(1);
        let (completions_tx, completions_rx) = mpsc::channel(window);
        let shared = Arc::new(PipelineShared {
            target,
            gate: Arc::new(Semaphore::new(window)),
            dispatcher,
            inner: Mutex::new(PipelineInner {
                closed: false,
                next_seq: 0,
                in_flight: VecDeque::with_capacity(window),
                completions_tx: Some(completions_tx),
                completions_rx: Some(completions_rx),
                released: 0,
            }),
        });
        Self { shared }
    }

    /// The follower this pipeline replicates to.
    pub fn target(&self) -> &PeerAddress {
        &self.shared.target
    }

    /// Submit a request.
    ///
    /// Waits while the window is full, then returns a future stamped with
    /// the submission time.  Fails with [`TransportError::PipelineClosed`]
    /// after [`Self::close`], including for submitters that were waiting
    /// on the window when the pipeline closed.
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendFuture> {
        let permit = self
            .shared
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::PipelineClosed)?;

        let request = Arc::new(request);
        let mut inner = self.shared.lock();
        if inner.closed {
            return Err(TransportError::PipelineClosed);
        }
        let seq = inner.next_seq;
        inner.next_seq = seq.wrapping_add(1);

        let future = AppendFuture::new(seq, request.clone());
        let pending = self.shared.dispatcher.dispatch(request);
        let weak: Weak<PipelineShared> = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            let result = pending.await;
            if let Some(shared) = weak.upgrade() {
                shared.complete(seq, result);
            }
        });
        inner.in_flight.push_back(InFlight {
            future: future.clone(),
            task: Some(task.abort_handle()),
            _permit: permit,
        });
        Ok(future)
    }

    /// Take the completion stream.  Returns `None` after the first call,
    /// or once the pipeline is closed without it having been taken.
    pub fn completions(&mut self) -> Option<Completions> {
        let rx = self.shared.lock().completions_rx.take()?;
        Some(Completions {
            shared: self.shared.clone(),
            rx,
        })
    }

    /// Number of submitted requests not yet released to the consumer.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Close the pipeline and cancel everything in flight.  Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shared.close();
        Ok(())
    }

    /// Handle a transport keeps to close this pipeline on disconnect.
    pub(crate) fn closer(&self) -> PipelineCloser {
        PipelineCloser {
            target: self.shared.target.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for AppendPipeline {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Resolved futures of one pipeline, in submission order.
pub struct Completions {
    shared: Arc<PipelineShared>,
    rx: mpsc::Receiver<AppendFuture>,
}

impl Completions {
    /// Wait for the next future in submission order.
    ///
    /// Every yielded future is already resolved.  Returns `None` once the
    /// pipeline is closed and drained.
    pub async fn recv(&mut self) -> Option<AppendFuture> {
        let future = self.rx.recv().await?;
        let mut inner = self.shared.lock();
        inner.released = inner.released.saturating_sub(1);
        PipelineShared::release_ready(&mut inner);
        Some(future)
    }
}

impl Drop for Completions {
    fn drop(&mut self) {
        // Nobody will consume what is buffered or still queued.
        self.rx.close();
        let mut inner = self.shared.lock();
        inner.released = 0;
        PipelineShared::release_ready(&mut inner);
    }
}

/// Weak close handle; does not keep the pipeline alive.
#[derive(Clone)]
pub(crate) struct PipelineCloser {
    target: PeerAddress,
    shared: Weak<PipelineShared>,
}

impl PipelineCloser {
    pub(crate) fn target(&self) -> &PeerAddress {
        &self.target
    }

    /// Whether the pipeline still exists and is open.
    pub(crate) fn is_live(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| !shared.lock().closed)
    }

    pub(crate) fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.close();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
