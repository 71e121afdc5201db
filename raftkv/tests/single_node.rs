mod fixtures;

use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use bytes::Bytes;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;
use raftkv::error::CommitError;
use raftkv::raft_types::LogId;
use raftkv::txn::Consistency;
use raftkv::State;

/// A cluster of exactly one node commits every transaction locally, with
/// no network traffic.
///
/// - start an unconfigured node;
/// - form a cluster with a config-change transaction: log entry 1-1, the
///   node becomes leader, the cluster id becomes non-zero;
/// - a put commits at 1-2 and reads back.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn single_node_init_and_write() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    let node = router.new_node("alpha").await;

    tracing::info!("--- initializing single node cluster");
    let commit = router.init_cluster("alpha").await?;
    assert_eq!(commit, LogId { term: 1, index: 1 });

    let metrics = node.metrics().borrow().clone();
    assert_ne!(metrics.cluster_id, 0);
    assert_eq!(metrics.state, State::Leader);
    assert_eq!(metrics.current_term, 1);
    assert!(metrics.membership.contains_key("alpha"));

    tracing::info!("--- writing through the new leader");
    let commit = router.put("alpha", "k", "v").await?;
    assert_eq!(commit, LogId { term: 1, index: 2 });

    assert_eq!(
        router.get_eventual("alpha", "k").await?,
        Some(Bytes::from_static(b"v"))
    );

    // Write-then-read within one transaction sees the written value.
    let mut tx = node.begin().await?;
    tx.put(b"x", Bytes::from_static(b"1"))?;
    assert_eq!(tx.get(b"x"), Some(Bytes::from_static(b"1")));
    tx.commit().await?;

    Ok(())
}

/// A linearizable read-only commit on the leader rides the lease: it
/// returns its own base coordinates without waiting.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn read_only_lease_fast_path() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    let node = router.new_node("alpha").await;
    router.init_cluster("alpha").await?;
    router.put("alpha", "k", "v").await?;

    let mut tx = node.begin().await?;
    let base = tx.base();
    assert_eq!(tx.get(b"k"), Some(Bytes::from_static(b"v")));

    let started = Instant::now();
    let commit = tx.commit().await?;
    assert_eq!(commit, base);
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

/// Two transactions that both read a key and write it: the first commit
/// wins, the second fails with a retry error naming the winning index.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn conflicting_transactions() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    let node = router.new_node("alpha").await;
    router.init_cluster("alpha").await?;
    router.put("alpha", "k", "0").await?;

    let mut t1 = node.begin().await?;
    let mut t2 = node.begin().await?;
    let _ = t1.get(b"k");
    let _ = t2.get(b"k");
    t1.put(b"k", Bytes::from_static(b"1"))?;
    t2.put(b"k", Bytes::from_static(b"2"))?;

    let winner = t1.commit().await?;
    let err = t2.commit().await.expect_err("second writer must lose");
    match &err {
        CommitError::Conflict(reason) => {
            assert!(
                reason.contains(&format!("index {}", winner.index)),
                "conflict reason should name the winning index: {}",
                reason
            );
        }
        other => panic!("expected a conflict error, got {:?}", other),
    }
    assert!(err.is_retry());

    assert_eq!(
        router.get_eventual("alpha", "k").await?,
        Some(Bytes::from_static(b"1"))
    );
    Ok(())
}

/// Blind writes do not conflict: two transactions writing the same key
/// without reading it both commit, last writer winning.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn blind_writes_do_not_conflict() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    let node = router.new_node("alpha").await;
    router.init_cluster("alpha").await?;

    let mut t1 = node.begin().await?;
    let mut t2 = node.begin().await?;
    t1.put(b"k", Bytes::from_static(b"1"))?;
    t2.put(b"k", Bytes::from_static(b"2"))?;
    t1.commit().await?;
    t2.commit().await?;

    assert_eq!(
        router.get_eventual("alpha", "k").await?,
        Some(Bytes::from_static(b"2"))
    );
    Ok(())
}

/// Removing the last configured member is a non-retriable error.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn removing_last_member_rejected() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    router.new_node("alpha").await;
    router.init_cluster("alpha").await?;

    let err = router.remove_member("alpha", "alpha").await.expect_err("must be rejected");
    assert!(matches!(err, CommitError::Fatal(_)), "got {:?}", err);
    Ok(())
}

/// Eventual transactions are read-only and commit with no cluster work.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn eventual_transactions_are_read_only() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    let node = router.new_node("alpha").await;
    router.init_cluster("alpha").await?;
    router.put("alpha", "k", "v").await?;

    let mut tx = node.begin_with(Consistency::Eventual).await?;
    assert_eq!(tx.get(b"k"), Some(Bytes::from_static(b"v")));
    let err = tx.put(b"k", Bytes::from_static(b"nope")).expect_err("eventual writes are rejected");
    assert!(matches!(err, CommitError::Fatal(_)));
    tx.commit().await?;
    Ok(())
}

/// Range scans merge the overlay with committed state and are tracked for
/// conflicts.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn range_scans_and_range_removes() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    let node = router.new_node("alpha").await;
    router.init_cluster("alpha").await?;
    for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
        router.put("alpha", k, v).await?;
    }

    let mut tx = node.begin().await?;
    tx.put(b"b2", Bytes::from_static(b"2.5"))?;
    tx.remove_range(b"c", None)?;
    let scanned: Vec<(Bytes, Bytes)> = tx.scan(b"a", None);
    let keys: Vec<&[u8]> = scanned.iter().map(|(k, _)| k.as_ref()).collect();
    assert_eq!(keys, vec![b"a".as_ref(), b"b", b"b2"]);
    tx.commit().await?;

    assert_eq!(router.get_eventual("alpha", "c").await?, None);
    assert_eq!(
        router.get_eventual("alpha", "b2").await?,
        Some(Bytes::from_static(b"2.5"))
    );
    Ok(())
}
