mod fixtures;

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;

/// Kill the leader; the survivors elect a replacement in a later term,
/// append its no-op entry, and keep serving commits. The old leader
/// rejoins as a follower and converges on the new history.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    router.new_node("alpha").await;
    router.new_node("beta").await;
    router.new_node("gamma").await;
    router.init_cluster("alpha").await?;
    router.add_member("alpha", "beta").await?;
    router.add_member("alpha", "gamma").await?;

    let before = router.put("alpha", "stable", "1").await?;
    router.wait_applied(&["alpha", "beta", "gamma"], before.index, "pre-failover write").await?;

    tracing::info!("--- isolating the leader");
    router.isolate_node("alpha").await;

    let new_leader = router.wait_for_leader(&["beta", "gamma"], "post-failover election").await?;
    tracing::info!(leader=%new_leader, "--- new leader elected");
    let leader_metrics = router.node(&new_leader).await.metrics().borrow().clone();
    assert!(leader_metrics.current_term >= 2, "election must advance the term");

    tracing::info!("--- writing through the new leader");
    let commit = router.put(&new_leader, "after", "failover").await?;
    assert!(commit.term >= leader_metrics.current_term);

    tracing::info!("--- restoring the old leader");
    router.restore_node("alpha").await;
    router.wait_applied(&["alpha", "beta", "gamma"], commit.index, "old leader caught up").await?;
    assert_eq!(
        router.get_eventual("alpha", "after").await?,
        Some(Bytes::from_static(b"failover"))
    );

    // The old leader observes the new one.
    router
        .node("alpha")
        .await
        .wait(Some(Duration::from_secs(5)))
        .current_leader(new_leader.clone(), "old leader adopts successor")
        .await?;
    Ok(())
}

/// An isolated leader can not commit: the commit times out with a retry
/// error instead of hanging.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_leader_commit_times_out() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    router.new_node("alpha").await;
    router.new_node("beta").await;
    router.new_node("gamma").await;
    router.init_cluster("alpha").await?;
    router.add_member("alpha", "beta").await?;
    let grown = router.add_member("alpha", "gamma").await?;
    router.wait_applied(&["alpha", "beta", "gamma"], grown.index, "cluster of three").await?;

    router.isolate_node("alpha").await;

    let node = router.node("alpha").await;
    let mut tx = node.begin().await?;
    tx.put(b"doomed", Bytes::from_static(b"1"))?;
    tx.set_commit_timeout(Duration::from_millis(500));
    let err = tx.commit().await.expect_err("isolated leader can not commit");
    assert!(err.is_retry(), "commit timeout is retriable: {:?}", err);
    Ok(())
}
