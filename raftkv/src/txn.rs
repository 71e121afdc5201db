//! Client transaction handles.
//!
//! A [`Transaction`] owns a consistent view of the database: a snapshot of
//! the applied state machine with every unapplied log entry's writes layered
//! on top, plus its own mutation overlay. Reads consult the overlay first,
//! then the entry layers newest-first, then the snapshot, and record what
//! they observed for conflict detection at commit time.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::error::CommitError;
use crate::log::LogEntry;
use crate::message::MAX_READS_SIZE;
use crate::mvcc::KeyRanges;
use crate::mvcc::Writes;
use crate::raft::CommitHandoff;
use crate::raft::CoreMsg;
use crate::raft_types::ConfigChange;
use crate::raft_types::LogId;
use crate::storage::prefixed_key;
use crate::storage::KvSnapshot;
use crate::storage::STATE_MACHINE_END;

// Transaction IDs need only be unique within one process lifetime.
static TX_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_tx_id() -> u64 {
    TX_IDS.fetch_add(1, Ordering::Relaxed)
}

/// The consistency level of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Full linearizable consistency: commits are ordered through the Raft
    /// log, and read-only commits are validated against the leader lease.
    Linearizable,
    /// Read-only snapshot consistency: the transaction sees some committed
    /// state that may be stale, and its commit involves no cluster traffic.
    Eventual,
}

/// An open transaction against the replicated store.
///
/// Reads and writes are local operations against the transaction's view;
/// only [`Transaction::commit`] talks to the cluster. `commit` and
/// [`Transaction::rollback`] consume the handle, so a settled transaction
/// can not be touched again. Dropping an unsettled handle rolls it back.
pub struct Transaction {
    id: u64,
    consistency: Consistency,
    base: LogId,
    snapshot: Box<dyn KvSnapshot>,
    layers: Vec<Arc<LogEntry>>,
    writes: Writes,
    reads: KeyRanges,
    config_change: Option<ConfigChange>,
    commit_timeout: Duration,
    tx_api: mpsc::UnboundedSender<CoreMsg>,
    settled: bool,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        consistency: Consistency,
        base: LogId,
        snapshot: Box<dyn KvSnapshot>,
        layers: Vec<Arc<LogEntry>>,
        commit_timeout: Duration,
        tx_api: mpsc::UnboundedSender<CoreMsg>,
    ) -> Self {
        Transaction {
            id,
            consistency,
            base,
            snapshot,
            layers,
            writes: Writes::new(),
            reads: KeyRanges::new(),
            config_change: None,
            commit_timeout,
            tx_api,
            settled: false,
        }
    }

    /// This transaction's process-unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The log coordinates this transaction is based on.
    pub fn base(&self) -> LogId {
        self.base
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    /// True if the transaction has buffered no mutations.
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.config_change.is_none()
    }

    /// Override the commit timeout for this transaction.
    pub fn set_commit_timeout(&mut self, timeout: Duration) {
        self.commit_timeout = timeout;
    }

    /// Read one key.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        // A hit in the local overlay is not a read of shared state.
        if let Some(found) = self.writes.get(key) {
            return found;
        }
        self.reads.add_key(key);
        for entry in self.layers.iter().rev() {
            if let Some(found) = entry.data.writes.get(key) {
                return found;
            }
        }
        self.snapshot.get(&prefixed_key(key))
    }

    /// Read all pairs in `[start, end)` in ascending key order; `end = None`
    /// is unbounded. The whole range is recorded as read.
    pub fn scan(&mut self, start: &[u8], end: Option<&[u8]>) -> Vec<(Bytes, Bytes)> {
        self.reads.add_range(start, end);

        let raw_start = prefixed_key(start);
        let raw_end = match end {
            Some(end) => prefixed_key(end),
            None => Bytes::from_static(STATE_MACHINE_END),
        };
        let mut merged: std::collections::BTreeMap<Bytes, Bytes> = self
            .snapshot
            .iter_range(&raw_start, Some(raw_end.as_ref()))
            .map(|(k, v)| (k.slice(1..), v))
            .collect();

        let mut apply = |writes: &Writes| {
            for (rm_start, rm_end) in writes.removes().iter() {
                let doomed: Vec<Bytes> = merged
                    .range::<[u8], _>((std::ops::Bound::Included(rm_start.as_ref()), std::ops::Bound::Unbounded))
                    .take_while(|(k, _)| match rm_end {
                        None => true,
                        Some(e) => k.as_ref() < e.as_ref(),
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    merged.remove(&key);
                }
            }
            for (key, value) in writes.puts() {
                let in_range = key.as_ref() >= start
                    && match end {
                        None => true,
                        Some(end) => key.as_ref() < end,
                    };
                if in_range {
                    merged.insert(key.clone(), value.clone());
                }
            }
        };
        for entry in &self.layers {
            apply(&entry.data.writes);
        }
        apply(&self.writes);

        merged.into_iter().collect()
    }

    /// Buffer a put of `key` to `value`.
    pub fn put(&mut self, key: &[u8], value: Bytes) -> Result<(), CommitError> {
        self.check_mutable()?;
        self.writes.put(key, value);
        Ok(())
    }

    /// Buffer a removal of `key`.
    pub fn remove(&mut self, key: &[u8]) -> Result<(), CommitError> {
        self.check_mutable()?;
        self.writes.remove(key);
        Ok(())
    }

    /// Buffer a removal of every key in `[start, end)`.
    pub fn remove_range(&mut self, start: &[u8], end: Option<&[u8]>) -> Result<(), CommitError> {
        self.check_mutable()?;
        self.writes.remove_range(start, end);
        Ok(())
    }

    /// Attach a cluster configuration change to this transaction: an
    /// `address` of `Some` adds or re-addresses `node_id`, `None` removes
    /// it. At most one change may ride on a transaction.
    pub fn config_change(&mut self, node_id: &str, address: Option<&str>) -> Result<(), CommitError> {
        self.check_mutable()?;
        self.config_change = Some(ConfigChange {
            node_id: node_id.to_string(),
            address: address.map(str::to_string),
        });
        Ok(())
    }

    fn check_mutable(&self) -> Result<(), CommitError> {
        match self.consistency {
            Consistency::Linearizable => Ok(()),
            Consistency::Eventual => Err(CommitError::Fatal("eventual transactions are read-only".into())),
        }
    }

    /// Commit this transaction, returning its commit coordinates.
    ///
    /// Read-only eventual transactions complete locally. Everything else is
    /// handed to the Raft core, which conflict-checks the transaction (on
    /// the leader, forwarding from a follower), assigns it a log position if
    /// it carries mutations, and completes it once that position is
    /// committed cluster-wide.
    #[tracing::instrument(level = "debug", skip(self), fields(tx=self.id))]
    pub async fn commit(mut self) -> Result<LogId, CommitError> {
        if let Consistency::Eventual = self.consistency {
            // Enforced at mutation time, so this is always read-only here.
            self.settle();
            return Ok(self.base);
        }

        let reads = self.reads.to_bytes();
        if reads.len() > MAX_READS_SIZE {
            self.settle();
            return Err(CommitError::Fatal(format!(
                "serialized read set of {} bytes exceeds the {} byte protocol limit",
                reads.len(),
                MAX_READS_SIZE
            )));
        }

        let (tx, rx) = oneshot::channel();
        let handoff = CommitHandoff {
            tx_id: self.id,
            base: self.base,
            read_only: self.is_read_only(),
            reads: std::mem::take(&mut self.reads),
            writes: std::mem::take(&mut self.writes),
            config_change: self.config_change.take(),
            deadline: Instant::now() + self.commit_timeout,
            responder: tx,
        };
        self.settled = true;
        if self.tx_api.send(CoreMsg::Commit(Box::new(handoff))).is_err() {
            return Err(CommitError::ShuttingDown);
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(CommitError::ShuttingDown),
        }
    }

    /// Abandon this transaction.
    pub fn rollback(mut self) {
        self.settle();
    }

    fn settle(&mut self) {
        if !self.settled {
            self.settled = true;
            let _ = self.tx_api.send(CoreMsg::Rollback { tx_id: self.id });
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.settle();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("consistency", &self.consistency)
            .field("base", &self.base)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}
