//! Fixtures for testing the replicated store.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use bytes::Bytes;
use memstore::MemStore;
use raftkv::async_trait::async_trait;
use raftkv::config::ConfigBuilder;
use raftkv::error::CommitError;
use raftkv::message::Message;
use raftkv::metrics::RaftMetrics;
use raftkv::raft_types::LogId;
use raftkv::raft_types::NodeId;
use raftkv::txn::Consistency;
use raftkv::Config;
use raftkv::RaftKv;
use raftkv::State;
use raftkv::Transport;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete node type used during testing.
pub type KvNode = RaftKv<RaftRouter, MemStore>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A type which emulates a network transport and implements the
/// `Transport` trait, routing messages between in-process nodes.
pub struct RaftRouter {
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (KvNode, Arc<MemStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// Keeps per-node log directories alive for the router's lifetime.
    tempdirs: std::sync::Mutex<Vec<TempDir>>,
}

impl RaftRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(RaftRouter {
            routing_table: RwLock::new(BTreeMap::new()),
            isolated_nodes: RwLock::new(HashSet::new()),
            tempdirs: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Test-friendly timing: fast heartbeats and elections, short log
    /// retention.
    pub fn test_config(id: &str, log_dir: std::path::PathBuf) -> ConfigBuilder {
        Config::build(id.to_string())
            .log_dir(log_dir)
            .heartbeat_timeout(50)
            .election_timeout_min(150)
            .election_timeout_max(300)
            .max_transaction_duration(1_000)
            .commit_timeout(5_000)
    }

    /// Create and register a new node bearing the given ID.
    pub async fn new_node(self: &Arc<Self>, id: &str) -> KvNode {
        self.new_node_with(id, |builder| builder).await
    }

    pub async fn new_node_with(
        self: &Arc<Self>,
        id: &str,
        tweak: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
    ) -> KvNode {
        let dir = tempfile::tempdir().expect("creating log dir");
        let config = tweak(Self::test_config(id, dir.path().to_path_buf())).validate().expect("valid config");
        self.tempdirs.lock().unwrap().push(dir);

        let store = MemStore::new_arc();
        let node = RaftKv::new(Arc::new(config), self.clone(), store.clone());
        self.routing_table.write().await.insert(id.to_string(), (node.clone(), store));
        node
    }

    pub async fn node(&self, id: &str) -> KvNode {
        self.routing_table.read().await.get(id).expect("node in routing table").0.clone()
    }

    pub async fn store(&self, id: &str) -> Arc<MemStore> {
        self.routing_table.read().await.get(id).expect("node in routing table").1.clone()
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: &str) -> Option<(KvNode, Arc<MemStore>)> {
        let removed = self.routing_table.write().await.remove(id);
        self.isolated_nodes.write().await.remove(id);
        removed
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: &str) {
        tracing::info!(id, "--- isolating node");
        self.isolated_nodes.write().await.insert(id.to_string());
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: &str) {
        tracing::info!(id, "--- restoring node");
        self.isolated_nodes.write().await.remove(id);
    }

    /// Form a new single-member cluster on `id` via a config-change
    /// transaction, returning its commit coordinates.
    pub async fn init_cluster(&self, id: &str) -> Result<LogId> {
        let node = self.node(id).await;
        let mut tx = node.begin().await?;
        tx.config_change(id, Some(&format!("test://{}", id)))?;
        let commit = tx.commit().await?;
        node.wait(Some(Duration::from_secs(5))).state(State::Leader, "init leader").await?;
        Ok(commit)
    }

    /// Add `id` to the cluster through the given leader.
    pub async fn add_member(&self, leader: &str, id: &str) -> Result<LogId> {
        let node = self.node(leader).await;
        let mut tx = node.begin().await?;
        tx.config_change(id, Some(&format!("test://{}", id)))?;
        Ok(tx.commit().await?)
    }

    /// Remove `id` from the cluster through the given leader.
    pub async fn remove_member(&self, leader: &str, id: &str) -> Result<LogId, CommitError> {
        let node = self.node(leader).await;
        let mut tx = node.begin().await?;
        tx.config_change(id, None)?;
        tx.commit().await
    }

    /// Commit one put through the given node.
    pub async fn put(&self, id: &str, key: &str, value: &str) -> Result<LogId, CommitError> {
        let node = self.node(id).await;
        let mut tx = node.begin().await?;
        tx.put(key.as_bytes(), Bytes::copy_from_slice(value.as_bytes()))?;
        tx.commit().await
    }

    /// Read one key through an eventual (local-only) transaction.
    pub async fn get_eventual(&self, id: &str, key: &str) -> Result<Option<Bytes>, CommitError> {
        let node = self.node(id).await;
        let mut tx = node.begin_with(Consistency::Eventual).await?;
        let value = tx.get(key.as_bytes());
        tx.commit().await?;
        Ok(value)
    }

    /// Wait for every listed node to apply entries through `index`.
    pub async fn wait_applied(&self, ids: &[&str], index: u64, msg: &str) -> Result<()> {
        for id in ids {
            self.node(id)
                .await
                .wait(Some(Duration::from_secs(10)))
                .applied(index, format!("{} (node {})", msg, id))
                .await?;
        }
        Ok(())
    }

    /// Wait until one of the listed nodes reports itself leader.
    pub async fn wait_for_leader(&self, ids: &[&str], msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            for id in ids {
                let metrics = self.node(id).await.metrics().borrow().clone();
                if metrics.state == State::Leader {
                    return Ok(metrics.id);
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|(node, _)| node.metrics().borrow().clone()).collect()
    }
}

#[async_trait]
impl Transport for RaftRouter {
    async fn send(&self, target: &NodeId, _address: &str, msg: Message) -> Result<()> {
        let sender = msg.header().sender.clone();
        {
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&sender) || isolated.contains(target) {
                return Err(anyhow!("node is isolated"));
            }
        }
        let node = {
            let rt = self.routing_table.read().await;
            match rt.get(target) {
                Some((node, _)) => node.clone(),
                None => return Err(anyhow!("node {} not found in routing table", target)),
            }
        };
        node.deliver(msg);
        Ok(())
    }
}
