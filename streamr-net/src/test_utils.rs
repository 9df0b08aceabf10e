// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for integration tests.

use std::future::Future;
use std::time::Duration;

use streamr_protocol::{MessageId, MessageRef, StreamKey, StreamMessage};

use crate::node::{Node, NodeConfig};
use crate::tracker::{Tracker, TrackerConfig};

/// Short timers so tests converge quickly.
pub const TEST_PING_INTERVAL: Duration = Duration::from_millis(500);
pub const TEST_DISCONNECTION_WAIT: Duration = Duration::from_millis(300);

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

pub async fn start_tracker(id: &str, port: u16) -> Tracker {
    Tracker::start(
        TrackerConfig::new(id, "127.0.0.1", port).with_ping_interval(TEST_PING_INTERVAL),
    )
    .await
    .expect("failed to start tracker")
}

pub fn node_config(id: &str, port: u16, tracker_urls: Vec<String>) -> NodeConfig {
    NodeConfig::new(id, "127.0.0.1", port)
        .with_trackers(tracker_urls)
        .with_ping_interval(TEST_PING_INTERVAL)
        .with_disconnection_wait_time(TEST_DISCONNECTION_WAIT)
}

pub async fn start_node(id: &str, port: u16, tracker_urls: Vec<String>) -> Node {
    Node::start(node_config(id, port, tracker_urls))
        .await
        .expect("failed to start node")
}

pub fn message(
    stream_id: &str,
    partition: u32,
    timestamp: i64,
    sequence_number: u32,
    publisher_id: &str,
) -> StreamMessage {
    let id = MessageId::new(
        StreamKey::new(stream_id, partition),
        timestamp,
        sequence_number,
        publisher_id,
        "chain-0",
    );
    let mut message = StreamMessage::new(id, format!("payload-{timestamp}").into_bytes());
    if timestamp > 0 {
        message = message.with_prev_msg_ref(MessageRef::new(timestamp - 1, sequence_number));
    }
    message
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
