//! Raft RPC Transport
//!
//! This crate is the boundary between a raft consensus engine and the
//! network.  It carries the three RPCs that drive election and
//! replication:
//!
//! - **Request vote**: candidates soliciting votes.
//! - **Append entries**: log replication and heartbeats from the leader,
//!   either as blocking calls or through a pipeline.
//! - **Install snapshot**: the leader streaming a snapshot to a follower
//!   that fell too far behind.
//!
//! Outbound calls look blocking to the engine (one call, one response or
//! typed error, bounded by the transport deadline).  Underneath, an
//! [`AppendPipeline`](pipeline::AppendPipeline) lets a leader keep a window
//! of append requests in flight per follower, with backpressure when the
//! window is full and results released strictly in submission order.
//!
//! ## Architecture
//!
//! ```text
//!  +-------------------------------------------------+
//!  |  Raft engine                                    |
//!  |  <- Rpc (consumer)        -> calls / pipelines  |
//!  +----------------+--------------------------------+
//!                   |  Transport trait
//!  +----------------v--------------------------------+
//!  |  AppendPipeline  (window, reorder, cancel)      |
//!  |  Responder / AppendFuture (write-once results)  |
//!  +-------+--------------------------+--------------+
//!          |                          |
//!  +-------v--------+         +-------v--------------+
//!  | InmemTransport |         | NetworkTransport     |
//!  | (in-process)   |         | (TCP, bincode frames)|
//!  +----------------+         +----------------------+
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]    | `TransportConfig` defaults and dev overrides |
//! | [`error`]     | Crate-wide error enum |
//! | [`message`]   | RPC payloads, wire frames, framing helpers |
//! | [`peer`]      | Peer addresses and their persistable encoding |
//! | [`rpc`]       | Inbound envelope, one-shot responder, consumer queue |
//! | [`future`]    | `AppendFuture` for pipelined requests |
//! | [`pipeline`]  | Windowed, order-preserving append pipeline |
//! | [`transport`] | The `Transport` trait |
//! | [`inmem`]     | In-process transport |
//! | [`net`]       | TCP transport |

pub mod config;
pub mod error;
pub mod future;
pub mod inmem;
pub mod message;
pub mod net;
pub mod peer;
pub mod pipeline;
pub mod rpc;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use {
    config::TransportConfig,
    error::{Result, TransportError},
    future::AppendFuture,
    inmem::InmemTransport,
    net::NetworkTransport,
    peer::PeerAddress,
    pipeline::{AppendPipeline, Completions, PipelineDispatch, PipelineState},
    rpc::{Responder, Rpc, RpcConsumer, SnapshotReader},
    transport::Transport,
};
