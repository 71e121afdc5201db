//! A strongly-consistent, transactional key/value store replicated with
//! the Raft consensus algorithm.
//!
//! Each node wraps an application-provided atomic key/value store
//! ([`KvStore`]) and network transport ([`Transport`]). The engine
//! replicates a totally ordered log of write batches across the cluster,
//! elects a leader to serialize commits, and layers optimistic MVCC
//! transactions on top: a [`Transaction`] reads from a consistent snapshot,
//! buffers its writes locally, and at commit time is conflict-checked
//! against every log entry appended after its base. Read-only linearizable
//! commits ride the leader lease and involve no log append; eventual
//! read-only transactions never leave the local node.
//!
//! The [`fallback`] module adds a supervisor that degrades to a standalone
//! local store while the cluster is unreachable.

pub mod config;
pub mod core;
pub mod error;
pub mod fallback;
pub mod log;
pub mod message;
pub mod metrics;
pub mod mvcc;
pub mod network;
mod quorum;
pub mod raft;
pub mod raft_types;
pub mod storage;
pub mod txn;

mod replication;

pub use async_trait;

pub use crate::config::Config;
pub use crate::core::State;
pub use crate::error::CommitError;
pub use crate::error::ConfigError;
pub use crate::error::ProtocolError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::message::Message;
pub use crate::message::MessageCodec;
pub use crate::metrics::RaftMetrics;
pub use crate::metrics::Wait;
pub use crate::mvcc::KeyRanges;
pub use crate::mvcc::Writes;
pub use crate::network::Transport;
pub use crate::raft::RaftKv;
pub use crate::raft_types::ClusterId;
pub use crate::raft_types::ConfigChange;
pub use crate::raft_types::LogId;
pub use crate::raft_types::Membership;
pub use crate::raft_types::MessageSummary;
pub use crate::raft_types::NodeId;
pub use crate::raft_types::Timestamp;
pub use crate::storage::KvSnapshot;
pub use crate::storage::KvStore;
pub use crate::txn::Consistency;
pub use crate::txn::Transaction;
