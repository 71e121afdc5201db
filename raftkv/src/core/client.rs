//! The transaction commit pipeline: conflict checking, log assignment,
//! the read-only lease fast path, and follower forwarding.

use crate::core::CommitStage;
use crate::core::FollowerState;
use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::error::CommitError;
use crate::error::RaftResult;
use crate::log::EntryData;
use crate::message::CommitRequest;
use crate::message::CommitResponse;
use crate::message::CommitResult;
use crate::message::Message;
use crate::mvcc::KeyRanges;
use crate::mvcc::Writes;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::replication::RaftEvent;
use crate::storage::KvStore;
use crate::Transport;

impl<N: Transport, S: KvStore> RaftCore<N, S> {
    /// The MVCC conflict check: validate a transaction's base coordinates
    /// and test its read set against the writes of every entry appended
    /// after the base.
    pub(crate) fn check_conflicts(&self, base: LogId, reads: &KeyRanges) -> Result<(), String> {
        let last_log = self.log.last_log_id();
        if base.index > last_log.index {
            return Err(format!(
                "transaction base {} is beyond the log (last entry {})",
                base, last_log
            ));
        }
        if base.index < self.last_applied.index {
            return Err(format!(
                "transaction base {} is too old; entries through {} have been applied",
                base, self.last_applied
            ));
        }
        match self.log.term_at(base.index) {
            Some(term) if term == base.term => {}
            Some(term) => {
                return Err(format!(
                    "transaction base {} does not match the entry of term {} at that index",
                    base, term
                ))
            }
            None => return Err(format!("transaction base {} is no longer available", base)),
        }

        for index in (base.index + 1)..=last_log.index {
            if let Some(entry) = self.log.entry(index) {
                if let Some(key) = reads.intersects_writes(&entry.data.writes) {
                    return Err(format!(
                        "read/write conflict with the entry committed at index {} (key {:02x?})",
                        index,
                        key.as_ref()
                    ));
                }
            }
        }
        Ok(())
    }
}

impl<'a, N: Transport, S: KvStore> LeaderState<'a, N, S> {
    /// Progress every commit still in the ready stage.
    pub(crate) async fn check_ready_commits(&mut self) -> RaftResult<()> {
        let ready: Vec<u64> = self
            .core
            .commits
            .iter()
            .filter(|(_, c)| matches!(c.stage, CommitStage::Ready))
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }
        for tx_id in ready {
            self.process_ready_commit(tx_id).await?;
        }
        // A single-member cluster commits its own appends on the spot.
        self.advance_commit_index().await
    }

    /// Conflict-check one ready commit and either complete it (read-only
    /// with a live lease), park it waiting on the lease, or assign it a log
    /// entry.
    #[tracing::instrument(level = "debug", skip(self), fields(id=%self.core.id, tx=tx_id))]
    async fn process_ready_commit(&mut self, tx_id: u64) -> RaftResult<()> {
        let (base, read_only, config_change) = match self.core.commits.get(&tx_id) {
            Some(c) => (c.base, c.read_only, c.config_change.clone()),
            None => return Ok(()),
        };

        if let Some(change) = &config_change {
            if let Err(err) = self.validate_config_change(change) {
                self.core.finish_commit(tx_id, Err(err)).await;
                return Ok(());
            }
        }

        let reads = match self.core.commits.get(&tx_id) {
            Some(c) => c.reads.clone(),
            None => return Ok(()),
        };
        if let Err(reason) = self.core.check_conflicts(base, &reads) {
            tracing::debug!(tx = tx_id, %reason, "commit rejected by conflict check");
            self.core.finish_commit(tx_id, Err(CommitError::Conflict(reason))).await;
            return Ok(());
        }

        if read_only {
            // The leader lease read fast path: while no other leader can
            // exist, the validated reads are linearizable as of now. A
            // quorum of one refreshes its own lease on the spot.
            self.recompute_lease();
            if self.core.lease_valid() {
                self.core.finish_commit(tx_id, Ok(base)).await;
            } else {
                let min_lease = Some(self.core.clock.now());
                if let Some(commit) = self.core.commits.get_mut(&tx_id) {
                    commit.stage = CommitStage::Waiting {
                        commit: base,
                        min_lease,
                    };
                }
            }
            return Ok(());
        }

        let writes = match self.core.commits.get(&tx_id) {
            Some(c) => c.writes.clone(),
            None => return Ok(()),
        };
        let data = EntryData {
            writes,
            config_change,
        };
        match self.try_append(data, None).await {
            Ok(log_id) => {
                if let Some(commit) = self.core.commits.get_mut(&tx_id) {
                    commit.stage = CommitStage::Waiting {
                        commit: log_id,
                        min_lease: None,
                    };
                }
            }
            Err(err) => {
                tracing::error!(tx = tx_id, error=?err, "error persisting transaction mutations");
                self.core
                    .finish_commit(tx_id, Err(CommitError::Fatal(format!("error persisting mutations: {}", err))))
                    .await;
            }
        }
        Ok(())
    }

    /// Append an entry at the next index in the current term and fan it out
    /// to the replication streams. `origin` names a follower that already
    /// holds the entry's mutation data locally; its copy is sent without
    /// the data, exactly once.
    pub(crate) async fn try_append(&mut self, data: EntryData, origin: Option<&NodeId>) -> anyhow::Result<LogId> {
        let log_id = LogId {
            term: self.core.current_term,
            index: self.core.log.last_log_id().index + 1,
        };
        let entry = self.core.log.append(log_id, data).await?;

        if let Some(change) = &entry.data.config_change {
            self.pending_config_change = Some(log_id.index);
            self.core.rebuild_membership();
            match &change.address {
                // Adding a peer begins heartbeats to it immediately.
                Some(_) => {
                    if change.node_id != self.core.id && !self.nodes.contains_key(&change.node_id) {
                        self.spawn_replication_stream(&change.node_id.clone());
                    }
                }
                // A removed peer keeps receiving heartbeats until it has
                // acknowledged the entry that removes it.
                None => {
                    if let Some(node) = self.nodes.get_mut(&change.node_id) {
                        node.remove_after_commit = Some(log_id.index);
                    }
                }
            }
        }

        for (target, node) in &self.nodes {
            let skip_data = origin.map(|o| o == target).unwrap_or(false);
            let _ = node.repl.repl_tx.send(RaftEvent::Replicate {
                entry: entry.clone(),
                commit_index: self.core.commit_index,
                lease: self.core.lease,
                skip_data,
            });
        }
        self.core.report_metrics();
        Ok(log_id)
    }

    /// The fallible-for-the-node variant used for the leader's own no-op
    /// entry, where a failed append means we can not lead.
    pub(crate) async fn append_entry(&mut self, data: EntryData, origin: Option<&NodeId>) -> RaftResult<LogId> {
        match self.try_append(data, origin).await {
            Ok(log_id) => Ok(log_id),
            Err(err) => Err(self.core.map_fatal_storage_error(err)),
        }
    }

    /// Serve a `CommitRequest` forwarded by a follower.
    ///
    /// The success response goes out immediately once coordinates are
    /// assigned — before the entry itself replicates — so the follower can
    /// match the skip-data entry when it arrives; the follower then waits
    /// for its own commit index to cover the coordinates.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id=%self.core.id, tx=req.tx_id))]
    pub(crate) async fn handle_commit_request(&mut self, req: CommitRequest) -> RaftResult<()> {
        let origin = req.header.sender.clone();
        let tx_id = req.tx_id;
        let base = LogId {
            term: req.base_term,
            index: req.base_index,
        };

        let reads = match KeyRanges::from_bytes(req.reads) {
            Ok(reads) => reads,
            Err(err) => {
                tracing::warn!(from=%origin, error=%err, "malformed read set in commit request");
                self.respond_commit(&origin, tx_id, CommitResult::Failure {
                    message: "malformed read set".into(),
                })
                .await;
                return Ok(());
            }
        };
        if let Err(reason) = self.core.check_conflicts(base, &reads) {
            self.respond_commit(&origin, tx_id, CommitResult::Failure { message: reason }).await;
            return Ok(());
        }

        match req.mutations {
            None => {
                // Read-only: sit on the lease, or promise a future one.
                self.recompute_lease();
                let min_lease_timeout = if self.core.lease_valid() {
                    None
                } else {
                    Some(self.core.clock.now())
                };
                self.respond_commit(&origin, tx_id, CommitResult::Success {
                    commit_term: base.term,
                    commit_index: base.index,
                    min_lease_timeout,
                })
                .await;
            }
            Some(bytes) => {
                let writes = match Writes::from_bytes(bytes) {
                    Ok(writes) => writes,
                    Err(err) => {
                        tracing::warn!(from=%origin, error=%err, "malformed mutations in commit request");
                        self.respond_commit(&origin, tx_id, CommitResult::Failure {
                            message: "malformed mutations".into(),
                        })
                        .await;
                        return Ok(());
                    }
                };
                let data = EntryData {
                    writes,
                    config_change: None,
                };
                match self.try_append(data, Some(&origin)).await {
                    Ok(log_id) => {
                        self.respond_commit(&origin, tx_id, CommitResult::Success {
                            commit_term: log_id.term,
                            commit_index: log_id.index,
                            min_lease_timeout: None,
                        })
                        .await;
                        self.advance_commit_index().await?;
                    }
                    Err(err) => {
                        tracing::error!(from=%origin, error=?err, "error persisting forwarded mutations");
                        self.respond_commit(&origin, tx_id, CommitResult::Failure {
                            message: format!("error persisting mutations: {}", err),
                        })
                        .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn respond_commit(&mut self, origin: &NodeId, tx_id: u64, result: CommitResult) {
        let msg = Message::CommitReply(CommitResponse {
            header: self.core.header_to(origin),
            tx_id,
            result,
        });
        self.core.send_to(origin, msg).await;
    }
}

impl<'a, N: Transport, S: KvStore> FollowerState<'a, N, S> {
    /// Drive ready commits forward and settle anything now satisfied.
    pub(crate) async fn progress_commits(&mut self) -> RaftResult<()> {
        self.forward_ready_commits().await?;
        self.core.advance(None).await
    }

    /// Forward every ready, not-yet-forwarded commit to the leader; on an
    /// unconfigured node, the first config-change commit instead forms a
    /// new cluster.
    pub(crate) async fn forward_ready_commits(&mut self) -> RaftResult<()> {
        if self.core.cluster_id == 0 {
            return self.maybe_initialize_cluster().await;
        }
        let leader = match &self.core.current_leader {
            Some(leader) => leader.clone(),
            None => return Ok(()),
        };
        let pending: Vec<u64> = self
            .core
            .commits
            .iter()
            .filter(|(_, c)| matches!(c.stage, CommitStage::Ready) && !c.forwarded)
            .map(|(id, _)| *id)
            .collect();
        for tx_id in pending {
            self.forward_commit(tx_id, &leader).await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, leader), fields(id=%self.core.id, tx=tx_id))]
    async fn forward_commit(&mut self, tx_id: u64, leader: &NodeId) -> RaftResult<()> {
        let (base, read_only, has_config_change) = match self.core.commits.get(&tx_id) {
            Some(c) => (c.base, c.read_only, c.config_change.is_some()),
            None => return Ok(()),
        };
        if has_config_change {
            // The commit request wire format carries no config change;
            // such transactions must run against the leader directly.
            self.core
                .finish_commit(
                    tx_id,
                    Err(CommitError::Conflict(
                        "configuration changes must be committed through the leader".into(),
                    )),
                )
                .await;
            return Ok(());
        }

        let reads = match self.core.commits.get(&tx_id) {
            Some(c) => c.reads.to_bytes(),
            None => return Ok(()),
        };
        let mutations = if read_only {
            None
        } else {
            let bytes = match self.core.commits.get(&tx_id) {
                Some(c) => c.writes.to_bytes(),
                None => return Ok(()),
            };
            // Stage the mutations durably so they survive us until the
            // leader's entry comes back around.
            match self.core.log.write_temp(&bytes).await {
                Ok(path) => {
                    if let Some(commit) = self.core.commits.get_mut(&tx_id) {
                        commit.temp_file = Some(path);
                    }
                }
                Err(err) => {
                    tracing::error!(tx = tx_id, error=?err, "error staging transaction mutations");
                    self.core
                        .finish_commit(
                            tx_id,
                            Err(CommitError::Fatal(format!("error persisting mutations: {}", err))),
                        )
                        .await;
                    return Ok(());
                }
            }
            Some(bytes)
        };

        let msg = Message::Commit(CommitRequest {
            header: self.core.header_to(leader),
            tx_id,
            base_term: base.term,
            base_index: base.index,
            reads,
            mutations,
        });
        self.core.send_to(leader, msg).await;
        if let Some(commit) = self.core.commits.get_mut(&tx_id) {
            commit.forwarded = true;
        }
        Ok(())
    }

    /// Handle the leader's answer to a forwarded commit.
    pub(crate) async fn handle_commit_reply(&mut self, resp: CommitResponse) -> RaftResult<()> {
        let known = match self.core.commits.get(&resp.tx_id) {
            Some(c) => matches!(c.stage, CommitStage::Ready) && c.forwarded,
            None => false,
        };
        if !known {
            tracing::debug!(tx = resp.tx_id, "ignoring stale commit response");
            return Ok(());
        }
        match resp.result {
            CommitResult::Failure { message } => {
                self.core.finish_commit(resp.tx_id, Err(CommitError::Conflict(message))).await;
                Ok(())
            }
            CommitResult::Success {
                commit_term,
                commit_index,
                min_lease_timeout,
            } => {
                if let Some(commit) = self.core.commits.get_mut(&resp.tx_id) {
                    commit.stage = CommitStage::Waiting {
                        commit: LogId {
                            term: commit_term,
                            index: commit_index,
                        },
                        min_lease: min_lease_timeout,
                    };
                }
                // It may already be satisfiable (e.g. a read-only commit
                // whose base is long committed and the lease known).
                self.core.advance(None).await
            }
        }
    }
}
