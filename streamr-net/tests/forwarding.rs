// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message forwarding across the overlay: partial unsubscribes, dedup
//! ordering, no-shared-streams disconnects and stale instructions.

use std::time::Duration;

use streamr_net::node::NodeEvent;
use streamr_net::test_utils::{message, setup_logging, start_node, start_tracker, wait_until};

const CONVERGENCE: Duration = Duration::from_secs(10);

async fn overlay_paired(tracker: &streamr_net::Tracker, stream: &str) -> bool {
    tracker
        .get_topology()
        .await
        .map(|topology| {
            topology
                .get(stream)
                .map(|overlay| overlay.values().all(|neighbours| neighbours.len() == 1))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

/// Block until `events` has seen the peer subscribe for the given key;
/// after that, broadcasts from the peer are accepted and its own forwarding
/// entry is in place.
async fn await_subscribed(
    events: &mut tokio::sync::broadcast::Receiver<NodeEvent>,
    peer: &str,
    stream: &str,
) {
    tokio::time::timeout(CONVERGENCE, async {
        loop {
            if let Ok(NodeEvent::NodeSubscribed {
                peer_id,
                stream_key,
            }) = events.recv().await
            {
                if peer_id == peer && stream_key.to_string() == stream {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{peer} never subscribed for {stream}"));
}

#[tokio::test]
async fn partial_unsubscribe_filters_forwarding_then_disconnects() {
    setup_logging();

    let tracker = start_tracker("tracker", 32410).await;
    let tracker_urls = vec!["ws://127.0.0.1:32410".to_string()];
    let node_a = start_node("nodeA", 33381, tracker_urls.clone()).await;
    let node_b = start_node("nodeB", 33382, tracker_urls).await;
    let mut subscribe_events_b = node_b.events();

    for node in [&node_a, &node_b] {
        node.subscribe("s", 1).await.unwrap();
        node.subscribe("s", 2).await.unwrap();
    }
    let tracker_ref = &tracker;
    assert!(
        wait_until(CONVERGENCE, || async move {
            overlay_paired(tracker_ref, "s::1").await && overlay_paired(tracker_ref, "s::2").await
        })
        .await,
        "overlays never formed"
    );
    // The forwarding edge nodeA -> nodeB must actually be in place.
    await_subscribed(&mut subscribe_events_b, "nodeA", "s::1").await;

    // nodeB leaves partition 2; partition 1 stays shared.
    node_b.unsubscribe("s", 2).await.unwrap();
    assert!(
        wait_until(CONVERGENCE, || async move {
            tracker_ref
                .get_topology()
                .await
                .unwrap()
                .get("s::2")
                .map(|overlay| {
                    overlay.len() == 1
                        && overlay.get("nodeA").map(Vec::is_empty).unwrap_or(false)
                })
                .unwrap_or(false)
        })
        .await,
        "partition 2 overlay never shrank"
    );

    let mut events_b = node_b.events();

    // Publish to the dropped partition first, then to the shared one.
    node_a.publish(message("s", 2, 1000, 0, "publisher")).await.unwrap();
    node_a.publish(message("s", 1, 1001, 0, "publisher")).await.unwrap();

    // nodeB receives exactly one message, on the shared partition.
    let received = tokio::time::timeout(CONVERGENCE, async {
        loop {
            if let Ok(NodeEvent::MessageReceived { message }) = events_b.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("no message arrived at nodeB");
    assert_eq!(received.id.stream_key.to_string(), "s::1");
    assert_eq!(received.id.timestamp, 1001);

    // Nothing else shows up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut extra = 0;
    while let Ok(event) = events_b.try_recv() {
        if matches!(event, NodeEvent::MessageReceived { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0, "nodeB received a message for an unsubscribed key");

    // Dropping the last shared stream disconnects the pair within the
    // grace period, observed on both sides with the peer's address.
    let mut events_a = node_a.events();
    let mut events_b = node_b.events();
    node_a.unsubscribe("s", 1).await.unwrap();

    let a_saw = tokio::time::timeout(CONVERGENCE, async {
        loop {
            if let Ok(NodeEvent::NodeDisconnected { address, .. }) = events_a.recv().await {
                return address;
            }
        }
    })
    .await
    .expect("nodeA never observed the disconnect");
    assert_eq!(a_saw, node_b.advertised_url());

    let b_saw = tokio::time::timeout(CONVERGENCE, async {
        loop {
            if let Ok(NodeEvent::NodeDisconnected { address, .. }) = events_b.recv().await {
                return address;
            }
        }
    })
    .await
    .expect("nodeB never observed the disconnect");
    assert_eq!(b_saw, node_a.advertised_url());

    node_a.shutdown().await;
    node_b.shutdown().await;
    tracker.shutdown().await;
}

#[tokio::test]
async fn out_of_order_messages_within_a_chain_are_dropped() {
    setup_logging();

    let tracker = start_tracker("tracker", 32415).await;
    let tracker_urls = vec!["ws://127.0.0.1:32415".to_string()];
    let publisher = start_node("publisher", 33386, tracker_urls.clone()).await;
    let subscriber = start_node("subscriber", 33387, tracker_urls).await;

    let mut subscribe_events = subscriber.events();
    publisher.subscribe("ordered", 0).await.unwrap();
    subscriber.subscribe("ordered", 0).await.unwrap();
    let tracker_ref = &tracker;
    assert!(
        wait_until(CONVERGENCE, || async move {
            overlay_paired(tracker_ref, "ordered::0").await
        })
        .await
    );
    await_subscribed(&mut subscribe_events, "publisher", "ordered::0").await;

    let mut events = subscriber.events();
    for (timestamp, sequence_number) in [(10, 0), (10, 0), (9, 0), (10, 1), (12, 0)] {
        publisher
            .publish(message("ordered", 0, timestamp, sequence_number, "p1"))
            .await
            .unwrap();
    }

    // Strictly increasing (timestamp, sequenceNumber) per chain; the
    // duplicate and the out-of-order message never surface.
    let mut delivered = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        while delivered.len() < 3 {
            if let Ok(NodeEvent::MessageReceived { message }) = events.recv().await {
                delivered.push((message.id.timestamp, message.id.sequence_number));
            }
        }
    })
    .await;
    assert_eq!(delivered, vec![(10, 0), (10, 1), (12, 0)]);

    publisher.shutdown().await;
    subscriber.shutdown().await;
    tracker.shutdown().await;
}
