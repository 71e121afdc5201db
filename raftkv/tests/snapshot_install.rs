mod fixtures;

use anyhow::Result;
use bytes::Bytes;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;

/// A node added after the leader has applied (and discarded) its log
/// prefix is brought up through a streamed snapshot install, then switches
/// to normal replication.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_receives_snapshot() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    router.new_node("alpha").await;
    router.init_cluster("alpha").await?;

    // With no followers and no open transactions the leader applies and
    // discards entries immediately, guaranteeing the late joiner can not
    // be served from the log.
    tracing::info!("--- seeding state on the single-member cluster");
    let mut last = 0;
    for i in 0..32 {
        let commit = router.put("alpha", &format!("key-{:02}", i), &format!("value-{}", i)).await?;
        last = commit.index;
    }
    router.wait_applied(&["alpha"], last, "seed applied").await?;

    tracing::info!("--- adding a fresh follower");
    router.new_node("delta").await;
    let joined = router.add_member("alpha", "delta").await?;
    router.wait_applied(&["delta"], joined.index, "snapshot install + catch-up").await?;

    let leader_metrics = router.node("alpha").await.metrics().borrow().clone();
    let delta_metrics = router.node("delta").await.metrics().borrow().clone();
    assert_eq!(delta_metrics.cluster_id, leader_metrics.cluster_id);
    assert_eq!(delta_metrics.membership, leader_metrics.membership);

    tracing::info!("--- verifying the transferred state machine");
    for i in 0..32 {
        assert_eq!(
            router.get_eventual("delta", &format!("key-{:02}", i)).await?,
            Some(Bytes::copy_from_slice(format!("value-{}", i).as_bytes())),
            "key-{:02}",
            i
        );
    }

    // Replication continues normally after the install.
    let commit = router.put("alpha", "post", "snapshot").await?;
    router.wait_applied(&["alpha", "delta"], commit.index, "post-snapshot write").await?;
    assert_eq!(
        router.get_eventual("delta", "post").await?,
        Some(Bytes::from_static(b"snapshot"))
    );
    Ok(())
}
