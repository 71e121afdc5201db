//! Raft metrics for observability of a node's state.
//!
//! The core publishes a fresh [`RaftMetrics`] snapshot on a `watch` channel
//! whenever something noteworthy changes. [`Wait`] wraps the receiving side
//! with predicate-based awaiting, which the test suite leans on heavily.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::State;
use crate::raft_types::ClusterId;
use crate::raft_types::Membership;
use crate::raft_types::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// This node's identity.
    pub id: NodeId,
    /// The node's current role.
    pub state: State,
    /// The cluster the node belongs to; zero while unconfigured.
    pub cluster_id: ClusterId,
    /// The node's current term.
    pub current_term: u64,
    /// The index of the newest entry in the node's log.
    pub last_log_index: u64,
    /// The index of the last entry applied to the state machine.
    pub last_applied: u64,
    /// The index of the highest entry known to be committed.
    pub commit_index: u64,
    /// The node the cluster currently believes is leader, if known.
    pub current_leader: Option<NodeId>,
    /// The cluster membership as currently configured.
    pub membership: Membership,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        RaftMetrics {
            id,
            state: State::Follower,
            cluster_id: 0,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit_index: 0,
            current_leader: None,
            membership: Membership::new(),
        }
    }
}

/// Error variants from waiting on metrics conditions.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft node is shutting down")]
    ShuttingDown,
}

/// A handle for awaiting metric predicates with a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until `func` returns true for a metrics snapshot, returning the
    /// snapshot that satisfied it.
    #[tracing::instrument(level = "debug", skip(self, func, msg))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait satisfied: {} metrics: {:?}", msg.to_string(), latest);
                return Ok(latest);
            }
            match timeout(self.timeout, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for `last_log_index` to reach `want`.
    pub async fn log(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want,
            format!("{} .last_log_index >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for `last_applied` to reach `want`.
    pub async fn applied(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_applied >= want,
            format!("{} .last_applied >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the node to reach the given role.
    pub async fn state(&self, want: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want, format!("{} .state == {:?}", msg.to_string(), want)).await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, want: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader.as_ref() == Some(&want),
            format!("{} .current_leader == {}", msg.to_string(), want),
        )
        .await
    }
}
