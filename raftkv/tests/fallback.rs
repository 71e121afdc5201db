mod fixtures;

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use fixtures::RaftRouter;
use memstore::MemStore;
use pretty_assertions::assert_eq;
use raftkv::fallback::FallbackConfig;
use raftkv::fallback::FallbackKv;
use raftkv::fallback::FallbackTarget;

/// When the cluster stops answering availability probes, the supervisor
/// directs new transactions at the standalone store.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn falls_back_when_cluster_unavailable() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    let node = router.new_node("alpha").await;
    router.init_cluster("alpha").await?;
    router.put("alpha", "k", "cluster").await?;

    let standalone = MemStore::new_arc();
    let supervisor = FallbackKv::new(node.clone(), standalone, FallbackConfig {
        probe_interval: 50,
        probe_timeout: 250,
        fallback_threshold: 2,
        recovery_threshold: 1,
    });
    assert_eq!(supervisor.target(), FallbackTarget::Cluster);

    // While healthy, transactions hit the cluster.
    let mut tx = supervisor.begin().await?;
    assert_eq!(tx.get(b"k"), Some(Bytes::from_static(b"cluster")));
    tx.commit().await?;

    tracing::info!("--- stopping the cluster node");
    node.shutdown().await?;

    let mut watch = supervisor.watch_target();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *watch.borrow() != FallbackTarget::Standalone {
            watch.changed().await.expect("monitor alive");
        }
    })
    .await
    .expect("supervisor must fall back");

    // Standalone service continues.
    let mut tx = supervisor.begin().await?;
    tx.put(b"k", Bytes::from_static(b"standalone"))?;
    assert_eq!(tx.commit().await?, None);

    let mut tx = supervisor.begin().await?;
    assert_eq!(tx.get(b"k"), Some(Bytes::from_static(b"standalone")));
    tx.rollback();

    supervisor.shutdown().await.ok();
    Ok(())
}
