//! Coordinator election across several nodes sharing one database.


use std::time::Duration;

use cluster_coord::coordinator::{CoordinationStrategy, CoordinatorRole};
use test_harness::{settle, TestCluster};

#[tokio::test]
async fn test_first_node_becomes_coordinator_on_join() {
    let cluster = TestCluster::new(1).await;
    let node = cluster.get_node("node1").unwrap();

    // The join runs one election round before returning
    assert!(node.is_coordinator().await);
    assert_eq!(node.strategy.role().await, CoordinatorRole::Coordinator);

    let leader = node.strategy.get_leader_node().await.unwrap();
    assert_eq!(leader.node_id, "node1");
    assert!(leader.is_coordinator);
}

#[tokio::test]
async fn test_single_coordinator_elected() {
    let cluster = TestCluster::new(3).await;

    let leader = cluster
        .wait_for_coordinator(Duration::from_secs(5))
        .await
        .expect("A coordinator should be elected");
    assert_eq!(leader, "node1", "First node to join holds the lock");

    // Stays stable over several election periods
    settle().await;
    assert_eq!(cluster.count_coordinators().await, 1);
    assert_eq!(cluster.coordinator_id().await.as_deref(), Some("node1"));

    for node in cluster.active_nodes() {
        assert_eq!(
            node.strategy.known_leader_id().await.as_deref(),
            Some("node1"),
            "{} should follow node1",
            node.node_id
        );
    }
}

#[tokio::test]
async fn test_member_list_flags_exactly_one_coordinator() {
    let cluster = TestCluster::new(3).await;
    cluster
        .wait_for_coordinator(Duration::from_secs(5))
        .await
        .expect("A coordinator should be elected");

    let members = cluster
        .get_node("node2")
        .unwrap()
        .strategy
        .get_all_node_details()
        .await
        .unwrap();

    let ids: Vec<&str> = members.iter().map(|m| m.node_id.as_str()).collect();
    assert_eq!(ids, vec!["node1", "node2", "node3"]);

    let coordinators: Vec<&str> = members
        .iter()
        .filter(|m| m.is_coordinator)
        .map(|m| m.node_id.as_str())
        .collect();
    assert_eq!(coordinators, vec!["node1"]);
    assert!(members.iter().all(|m| m.last_heartbeat.is_some()));
}

#[tokio::test]
async fn test_coordinator_changed_delivered_to_new_coordinator() {
    let cluster = TestCluster::new(1).await;
    let node = cluster.get_node("node1").unwrap();

    test_harness::assert_eventually(
        || async { node.listener.coordinator_changed_count("node1") == 1 },
        Duration::from_secs(5),
        "node1 should hear about its own election",
    )
    .await;

    settle().await;
    assert_eq!(node.listener.coordinator_changed_count("node1"), 1);
}

#[tokio::test]
async fn test_unjoined_node_is_not_coordinator() {
    let cluster = TestCluster::empty();
    let node = cluster.create_node("loner").await;

    assert!(!node.strategy.is_leader_node().await);
    assert!(node.strategy.get_leader_node().await.is_none());
    assert!(node
        .strategy
        .get_all_node_details()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_simultaneous_joins_elect_one_coordinator() {
    let cluster = TestCluster::empty();
    let a = cluster.create_node("a").await;
    let b = cluster.create_node("b").await;
    let c = cluster.create_node("c").await;

    let (ra, rb, rc) = tokio::join!(
        a.strategy.join_group(),
        b.strategy.join_group(),
        c.strategy.join_group()
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let check = || async {
        let mut leaders = Vec::new();
        for node in [&a, &b, &c] {
            if node.strategy.is_leader_node().await {
                leaders.push(node.node_id.clone());
            }
        }
        leaders
    };

    assert!(
        test_harness::wait_for(
            || async { check().await.len() == 1 },
            Duration::from_secs(5),
            Duration::from_millis(25),
        )
        .await,
        "Exactly one of the racing nodes should win"
    );

    let winner = check().await.remove(0);
    settle().await;
    assert_eq!(check().await, vec![winner.clone()]);

    // Only the winner announced itself, once per member
    for node in [&a, &b, &c] {
        let total = node.listener.coordinator_changed().len();
        assert!(total <= 1, "{} got {} announcements", node.node_id, total);
        assert_eq!(node.listener.coordinator_changed_count(&winner), total);
    }
}
