//! End-to-end publish/subscribe behavior across a simulated cluster.

mod common;

use std::time::Duration;

use common::{assert_silent, mailbox, message, recv_within, topics, TestCluster};

use clustercast::hashing::HashFamily;
use clustercast::messages::Consistency;
use clustercast::replica::ReplicaReader;

/// The canonical scenario: subscribe with acknowledgement, publish from a
/// different node, receive exactly once, unsubscribe, then silence.
#[tokio::test]
async fn test_subscribe_publish_unsubscribe_scenario() {
    let cluster = TestCluster::start(3).await;
    let (subscriber, mut inbox) = mailbox();
    let subscriber_id = subscriber.id;

    cluster
        .handle(0)
        .subscribe(topics(&["foo"]), subscriber, Consistency::Local, true)
        .await
        .expect("subscribe acknowledged");

    // Publish from another node once the subscription has replicated.
    cluster.settle().await;
    cluster
        .handle(2)
        .publish(message(&["foo"], "hello"))
        .await
        .expect("publish accepted");

    let delivered = recv_within(&mut inbox, Duration::from_millis(500))
        .await
        .expect("message delivered");
    assert_eq!(delivered.body.as_ref(), b"hello");

    // Exactly once: nothing else arrives.
    assert_silent(&mut inbox, Duration::from_millis(100)).await;

    cluster
        .handle(0)
        .unsubscribe(topics(&["foo"]), subscriber_id, Consistency::Local, true)
        .await
        .expect("unsubscribe acknowledged");
    cluster.settle().await;

    cluster
        .handle(2)
        .publish(message(&["foo"], "after-unsubscribe"))
        .await
        .expect("publish accepted");
    assert_silent(&mut inbox, Duration::from_millis(150)).await;

    cluster.shutdown().await;
}

/// Convergence: after mutations stop, every node's replicated filter is a
/// superset of its true local topic set (no false negatives).
#[tokio::test]
async fn test_replicated_view_has_no_false_negatives() {
    let cluster = TestCluster::start(3).await;
    let family = HashFamily::new(
        &cluster.config().seed,
        cluster.config().hash_family_size,
    );

    // Spread overlapping subscriptions across the nodes.
    let per_node_topics = [
        vec!["alerts", "telemetry"],
        vec!["telemetry", "billing"],
        vec!["audit"],
    ];
    let mut inboxes = Vec::new();
    for (i, node_topics) in per_node_topics.iter().enumerate() {
        let (subscriber, inbox) = mailbox();
        inboxes.push(inbox);
        cluster
            .handle(i)
            .subscribe(topics(node_topics), subscriber, Consistency::Local, true)
            .await
            .expect("subscribe acknowledged");
    }

    cluster.settle().await;

    let merged = cluster.topic_replica.merged().await;
    for (i, node_topics) in per_node_topics.iter().enumerate() {
        let filter = merged
            .get(&cluster.address(i))
            .expect("node entry replicated");
        for topic in node_topics {
            assert!(
                filter.might_contain_hashes(&family.hashes(topic)),
                "node {i} filter lost topic {topic}"
            );
        }
    }

    cluster.shutdown().await;
}

/// Subscribe followed by unsubscribe restores the pre-subscribe export: the
/// node's replicated entry disappears, and re-subscribing reproduces the
/// identical filter.
#[tokio::test]
async fn test_subscribe_unsubscribe_idempotence() {
    let cluster = TestCluster::start(2).await;
    let node = cluster.address(0);

    let (first, _first_inbox) = mailbox();
    let first_id = first.id;
    cluster
        .handle(0)
        .subscribe(topics(&["a", "b"]), first, Consistency::Local, true)
        .await
        .unwrap();
    cluster.settle().await;
    let exported = cluster.topic_replica.merged().await[&node].clone();

    cluster
        .handle(0)
        .unsubscribe(topics(&["a", "b"]), first_id, Consistency::Local, true)
        .await
        .unwrap();
    cluster.settle().await;
    assert!(
        !cluster.topic_replica.merged().await.contains_key(&node),
        "empty store must remove the replicated entry"
    );

    let (second, _second_inbox) = mailbox();
    cluster
        .handle(0)
        .subscribe(topics(&["a", "b"]), second, Consistency::Local, true)
        .await
        .unwrap();
    cluster.settle().await;

    // Same topics, same config: bit-identical export.
    assert_eq!(cluster.topic_replica.merged().await[&node], exported);

    cluster.shutdown().await;
}

/// Local publish reaches local subscribers through the same path.
#[tokio::test]
async fn test_local_publish_delivery() {
    let cluster = TestCluster::start(1).await;
    let (subscriber, mut inbox) = mailbox();

    cluster
        .handle(0)
        .subscribe(topics(&["local"]), subscriber, Consistency::Local, true)
        .await
        .unwrap();
    cluster.settle().await;

    cluster
        .handle(0)
        .publish(message(&["local"], "loopback"))
        .await
        .unwrap();

    assert!(recv_within(&mut inbox, Duration::from_millis(500))
        .await
        .is_some());

    cluster.shutdown().await;
}

/// A message matching several subscribed topics is delivered once.
#[tokio::test]
async fn test_multi_topic_overlap_delivers_once() {
    let cluster = TestCluster::start(2).await;
    let (subscriber, mut inbox) = mailbox();

    cluster
        .handle(0)
        .subscribe(topics(&["a", "b"]), subscriber, Consistency::Local, true)
        .await
        .unwrap();
    cluster.settle().await;

    cluster
        .handle(1)
        .publish(message(&["a", "b"], "both"))
        .await
        .unwrap();

    assert!(recv_within(&mut inbox, Duration::from_millis(500))
        .await
        .is_some());
    assert_silent(&mut inbox, Duration::from_millis(100)).await;

    cluster.shutdown().await;
}

/// Local filter predicates gate delivery on the owning node only.
#[tokio::test]
async fn test_local_filter_predicate() {
    let cluster = TestCluster::start(2).await;
    let (subscriber, mut inbox) = mailbox();
    let subscriber = subscriber.with_filter(std::sync::Arc::new(|m: &clustercast::messages::Message| {
        m.body.as_ref() != b"reject-me"
    }));

    cluster
        .handle(0)
        .subscribe(topics(&["filtered"]), subscriber, Consistency::Local, true)
        .await
        .unwrap();
    cluster.settle().await;

    cluster
        .handle(1)
        .publish(message(&["filtered"], "reject-me"))
        .await
        .unwrap();
    cluster
        .handle(1)
        .publish(message(&["filtered"], "keep-me"))
        .await
        .unwrap();

    let delivered = recv_within(&mut inbox, Duration::from_millis(500))
        .await
        .expect("filtered delivery");
    assert_eq!(delivered.body.as_ref(), b"keep-me");
    assert_silent(&mut inbox, Duration::from_millis(100)).await;

    cluster.shutdown().await;
}

/// Publishing to a topic nobody subscribed to reaches nothing and nothing
/// breaks; the filters authoritatively skip every node.
#[tokio::test]
async fn test_publish_without_subscribers_is_silent() {
    let cluster = TestCluster::start(2).await;
    let (subscriber, mut inbox) = mailbox();

    cluster
        .handle(0)
        .subscribe(topics(&["present"]), subscriber, Consistency::Local, true)
        .await
        .unwrap();
    cluster.settle().await;

    cluster
        .handle(1)
        .publish(message(&["absent"], "void"))
        .await
        .unwrap();

    assert_silent(&mut inbox, Duration::from_millis(150)).await;
    cluster.shutdown().await;
}
