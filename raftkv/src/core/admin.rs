//! Cluster membership administration: config-change validation, the
//! effects of a committed change, and new-cluster initialization.

use rand::thread_rng;
use rand::Rng;

use crate::core::CommitStage;
use crate::core::FollowerState;
use crate::core::LeaderState;
use crate::core::State;
use crate::error::CommitError;
use crate::error::RaftResult;
use crate::log::EntryData;
use crate::mvcc::Writes;
use crate::raft_types::ConfigChange;
use crate::raft_types::LogId;
use crate::storage;
use crate::storage::KvStore;
use crate::Transport;

impl<'a, N: Transport, S: KvStore> LeaderState<'a, N, S> {
    /// Check that a proposed configuration change is currently admissible.
    pub(crate) fn validate_config_change(&self, change: &ConfigChange) -> Result<(), CommitError> {
        // At most one uncommitted config change may be in flight.
        if self.pending_config_change.is_some() {
            return Err(CommitError::Conflict(
                "another configuration change is already in flight".into(),
            ));
        }
        match &change.address {
            Some(address) => {
                if address.is_empty() {
                    return Err(CommitError::Fatal("peer address must not be empty".into()));
                }
                Ok(())
            }
            None => {
                if !self.core.membership.contains_key(&change.node_id) {
                    return Err(CommitError::Fatal(format!(
                        "no cluster member named \"{}\"",
                        change.node_id
                    )));
                }
                if self.core.membership.len() == 1 {
                    return Err(CommitError::Fatal(
                        "cannot remove the last remaining cluster member".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// React to the in-flight config change becoming committed: clear the
    /// single slot, and if the change removed this node, arrange to step
    /// down once the surrounding work completes.
    pub(crate) async fn handle_committed_config_change(&mut self) -> RaftResult<()> {
        let index = match self.pending_config_change {
            Some(index) if self.core.commit_index >= index => index,
            _ => return Ok(()),
        };
        self.pending_config_change = None;
        tracing::info!(id=%self.core.id, index, "configuration change committed");

        let removes_self = match self.core.log.entry(index) {
            Some(entry) => match &entry.data.config_change {
                Some(change) => change.address.is_none() && change.node_id == self.core.id,
                None => false,
            },
            // Already applied; fall back to the membership itself.
            None => !self.core.membership.contains_key(&self.core.id),
        };
        if removes_self {
            self.stepping_down = true;
        }
        Ok(())
    }
}

impl<'a, N: Transport, S: KvStore> FollowerState<'a, N, S> {
    /// On an unconfigured node, the first committed transaction must carry
    /// a config change adding the node itself: that transaction forms a
    /// brand new single-member cluster, with this node as leader of term 1
    /// and the transaction as log entry 1.
    pub(crate) async fn maybe_initialize_cluster(&mut self) -> RaftResult<()> {
        let ready: Vec<u64> = self
            .core
            .commits
            .iter()
            .filter(|(_, c)| matches!(c.stage, CommitStage::Ready))
            .map(|(id, _)| *id)
            .collect();

        for tx_id in ready {
            let change = match self.core.commits.get(&tx_id) {
                Some(c) => c.config_change.clone(),
                None => continue,
            };
            let change = match change {
                Some(change) => change,
                None => {
                    self.core
                        .finish_commit(
                            tx_id,
                            Err(CommitError::Fatal("node is not yet part of a cluster".into())),
                        )
                        .await;
                    continue;
                }
            };
            let adds_self = change.address.is_some() && change.node_id == self.core.id;
            if !adds_self {
                self.core
                    .finish_commit(
                        tx_id,
                        Err(CommitError::Fatal(
                            "cluster initialization must add the local node".into(),
                        )),
                    )
                    .await;
                continue;
            }
            if self.core.current_term != 0 || self.core.log.last_log_id().index != 0 {
                self.core
                    .finish_commit(
                        tx_id,
                        Err(CommitError::Fatal("node holds state from a previous cluster".into())),
                    )
                    .await;
                continue;
            }

            self.initialize_cluster(tx_id).await?;
            // Remaining ready commits are the new leader's to progress.
            return Ok(());
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self), fields(id=%self.core.id, tx=tx_id))]
    async fn initialize_cluster(&mut self, tx_id: u64) -> RaftResult<()> {
        let cluster_id = loop {
            let candidate: u32 = thread_rng().gen();
            if candidate != 0 {
                break candidate;
            }
        };

        // Cluster identity and the first term, durable in one batch.
        let mut batch = Writes::new();
        storage::put_cluster_id(&mut batch, cluster_id);
        storage::put_term(&mut batch, 1, Some(&self.core.id));
        let id = self.core.id.clone();
        self.core.storage.mutate(batch, true).await.map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.cluster_id = cluster_id;
        self.core.current_term = 1;
        self.core.voted_for = Some(id);

        let (writes, config_change) = match self.core.commits.get(&tx_id) {
            Some(c) => (c.writes.clone(), c.config_change.clone()),
            None => return Ok(()),
        };
        let log_id = LogId { term: 1, index: 1 };
        self.core
            .log
            .append(log_id, EntryData {
                writes,
                config_change,
            })
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.rebuild_membership();
        self.core.commit_index = 1;

        if let Some(commit) = self.core.commits.get_mut(&tx_id) {
            commit.stage = CommitStage::Waiting {
                commit: log_id,
                min_lease: None,
            };
        }

        tracing::info!(
            id=%self.core.id,
            cluster = cluster_id,
            "formed new single-member cluster"
        );
        self.core.current_leader = Some(self.core.id.clone());
        self.core.set_target_state(State::Leader);
        Ok(())
    }
}
