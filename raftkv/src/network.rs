//! The network transport interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::message::Message;
use crate::raft_types::NodeId;

/// A trait defining the interface for sending framed messages to peers.
///
/// The engine requires only one-way delivery: every protocol exchange is a
/// pair of independent messages, so there are no request/response futures
/// here. Implementations must deliver messages between any two peers in the
/// order they were sent; no ordering is assumed across different peers.
///
/// `send` resolving is the transport's backpressure signal: replication and
/// snapshot streams await it, so a slow peer naturally pauses its stream
/// without blocking the core. Errors are treated as transient — the caller
/// retries on its own cadence.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one message to the peer `target`, last known to live at
    /// `address`.
    ///
    /// `address` may be empty when the engine has no configured address for
    /// the peer (typically when replying to a leader before the config
    /// entry naming it has arrived); implementations should then fall back
    /// to an existing connection keyed by identity.
    async fn send(&self, target: &NodeId, address: &str, msg: Message) -> Result<()>;
}
