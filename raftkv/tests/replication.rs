mod fixtures;

use anyhow::Result;
use bytes::Bytes;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;

/// Grow a cluster to three members, write through the leader, and verify
/// every node applies the same state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_replication() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    router.new_node("alpha").await;
    router.new_node("beta").await;
    router.new_node("gamma").await;

    tracing::info!("--- forming the cluster on alpha");
    router.init_cluster("alpha").await?;
    router.add_member("alpha", "beta").await?;
    router.add_member("alpha", "gamma").await?;

    tracing::info!("--- writing through the leader");
    let commit = router.put("alpha", "x", "1").await?;
    router.wait_applied(&["alpha", "beta", "gamma"], commit.index, "replicated write").await?;

    for id in ["alpha", "beta", "gamma"] {
        assert_eq!(
            router.get_eventual(id, "x").await?,
            Some(Bytes::from_static(b"1")),
            "node {} state",
            id
        );
        let metrics = router.node(id).await.metrics().borrow().clone();
        assert_eq!(metrics.membership.len(), 3, "node {} membership", id);
        assert_eq!(metrics.current_leader.as_deref(), Some("alpha"), "node {} leader", id);
    }
    Ok(())
}

/// A transaction committed through a follower is forwarded to the leader,
/// assigned a log position, and completes once the follower itself holds
/// the committed entry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_forwards_commits() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    router.new_node("alpha").await;
    router.new_node("beta").await;
    router.new_node("gamma").await;
    router.init_cluster("alpha").await?;
    let joined = router.add_member("alpha", "beta").await?;
    router.add_member("alpha", "gamma").await?;
    router.wait_applied(&["beta"], joined.index, "beta joined").await?;

    tracing::info!("--- writing through follower beta");
    let commit = router.put("beta", "y", "2").await?;
    router.wait_applied(&["alpha", "beta", "gamma"], commit.index, "forwarded write").await?;
    for id in ["alpha", "beta", "gamma"] {
        assert_eq!(
            router.get_eventual(id, "y").await?,
            Some(Bytes::from_static(b"2")),
            "node {} state",
            id
        );
    }

    tracing::info!("--- linearizable read through follower beta");
    let node = router.node("beta").await;
    let mut tx = node.begin().await?;
    assert_eq!(tx.get(b"y"), Some(Bytes::from_static(b"2")));
    tx.commit().await?;
    Ok(())
}

/// Conflicting transactions race through different nodes; exactly one
/// wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_node_conflict() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    router.new_node("alpha").await;
    router.new_node("beta").await;
    router.init_cluster("alpha").await?;
    let joined = router.add_member("alpha", "beta").await?;
    router.wait_applied(&["beta"], joined.index, "beta joined").await?;
    let seeded = router.put("alpha", "k", "0").await?;
    router.wait_applied(&["beta"], seeded.index, "seed replicated").await?;

    let leader = router.node("alpha").await;
    let follower = router.node("beta").await;
    let mut t1 = leader.begin().await?;
    let mut t2 = follower.begin().await?;
    let _ = t1.get(b"k");
    let _ = t2.get(b"k");
    t1.put(b"k", Bytes::from_static(b"alpha-wins"))?;
    t2.put(b"k", Bytes::from_static(b"beta-wins"))?;

    let first = t1.commit().await;
    let second = t2.commit().await;
    assert!(first.is_ok(), "leader-side commit should win: {:?}", first.err());
    assert!(second.is_err(), "follower-side commit should conflict");
    Ok(())
}

/// A removed member stops being counted and stops receiving traffic once
/// it acknowledges its removal.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn member_removal() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    router.new_node("alpha").await;
    router.new_node("beta").await;
    router.new_node("gamma").await;
    router.init_cluster("alpha").await?;
    router.add_member("alpha", "beta").await?;
    let grown = router.add_member("alpha", "gamma").await?;
    router.wait_applied(&["alpha", "beta", "gamma"], grown.index, "cluster of three").await?;

    tracing::info!("--- removing gamma");
    let removal = router.remove_member("alpha", "gamma").await?;
    router.wait_applied(&["alpha", "beta"], removal.index, "removal committed").await?;

    for id in ["alpha", "beta"] {
        let metrics = router.node(id).await.metrics().borrow().clone();
        assert_eq!(metrics.membership.len(), 2, "node {} membership", id);
        assert!(!metrics.membership.contains_key("gamma"));
    }

    // The shrunken cluster still commits.
    let commit = router.put("alpha", "after", "removal").await?;
    router.wait_applied(&["alpha", "beta"], commit.index, "write after removal").await?;
    Ok(())
}
