// SPDX-License-Identifier: MIT OR Apache-2.0

//! Overlay formation and teardown through a real tracker.

use std::collections::HashMap;
use std::time::Duration;

use streamr_net::test_utils::{setup_logging, start_node, start_tracker};
use streamr_net::tracker::TopologySnapshot;
use streamr_net::Tracker;

const CONVERGENCE: Duration = Duration::from_secs(10);

fn expected(entries: &[(&str, &[(&str, &[&str])])]) -> TopologySnapshot {
    entries
        .iter()
        .map(|(stream, nodes)| {
            (
                stream.to_string(),
                nodes
                    .iter()
                    .map(|(node, neighbours)| {
                        (
                            node.to_string(),
                            neighbours.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
                        )
                    })
                    .collect::<HashMap<_, _>>(),
            )
        })
        .collect()
}

/// Poll the tracker until its topology matches, or time out.
async fn converges_to(tracker: &Tracker, expected: &TopologySnapshot) {
    let deadline = tokio::time::Instant::now() + CONVERGENCE;
    loop {
        let topology = tracker.get_topology().await.unwrap();
        if topology == *expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("topology never converged: got {topology:?}, wanted {expected:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn two_subscribers_form_and_dismantle_an_overlay() {
    setup_logging();

    let tracker = start_tracker("tracker", 32400).await;
    let tracker_urls = vec!["ws://127.0.0.1:32400".to_string()];
    let subscriber_one = start_node("subscriberOne", 33371, tracker_urls.clone()).await;
    let subscriber_two = start_node("subscriberTwo", 33372, tracker_urls).await;

    for node in [&subscriber_one, &subscriber_two] {
        node.subscribe("stream-1", 0).await.unwrap();
        node.subscribe("stream-2", 2).await.unwrap();
    }

    // Both statuses processed: the two nodes are paired on both streams.
    let paired = expected(&[
        (
            "stream-1::0",
            &[
                ("subscriberOne", &["subscriberTwo"]),
                ("subscriberTwo", &["subscriberOne"]),
            ],
        ),
        (
            "stream-2::2",
            &[
                ("subscriberOne", &["subscriberTwo"]),
                ("subscriberTwo", &["subscriberOne"]),
            ],
        ),
    ]);
    converges_to(&tracker, &paired).await;

    // Subscribing again changes nothing.
    subscriber_one.subscribe("stream-1", 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(tracker.get_topology().await.unwrap(), paired);

    // Incremental unsubscribe, one key at a time.
    subscriber_one.unsubscribe("stream-2", 2).await.unwrap();
    converges_to(
        &tracker,
        &expected(&[
            (
                "stream-1::0",
                &[
                    ("subscriberOne", &["subscriberTwo"]),
                    ("subscriberTwo", &["subscriberOne"]),
                ],
            ),
            ("stream-2::2", &[("subscriberTwo", &[])]),
        ]),
    )
    .await;

    subscriber_one.unsubscribe("stream-1", 0).await.unwrap();
    converges_to(
        &tracker,
        &expected(&[
            ("stream-1::0", &[("subscriberTwo", &[])]),
            ("stream-2::2", &[("subscriberTwo", &[])]),
        ]),
    )
    .await;

    // Unsubscribing the last participant removes the overlay entry.
    subscriber_two.unsubscribe("stream-1", 0).await.unwrap();
    converges_to(
        &tracker,
        &expected(&[("stream-2::2", &[("subscriberTwo", &[])])]),
    )
    .await;

    subscriber_two.unsubscribe("stream-2", 2).await.unwrap();
    converges_to(&tracker, &expected(&[])).await;

    // Unsubscribe with no prior subscribe is a no-op.
    subscriber_two
        .unsubscribe("never-subscribed", 0)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(tracker.get_topology().await.unwrap().is_empty());

    subscriber_one.shutdown().await;
    subscriber_two.shutdown().await;
    tracker.shutdown().await;
}
