// SPDX-License-Identifier: MIT OR Apache-2.0

//! Historical messages served by a storage node over the wire.

use std::sync::Arc;
use std::time::Duration;

use streamr_net::endpoint::{Endpoint, EndpointConfig, EndpointEvent};
use streamr_net::protocols::NodeToNode;
use streamr_net::resend::{MemoryMessageStore, MessageStore, ResendKind, ResendRequest};
use streamr_net::test_utils::{message, node_config, setup_logging};
use streamr_net::{Node, PeerInfo};
use streamr_protocol::{NodeControlMessage, ResendResponseKind, StreamKey};
use tokio::sync::mpsc;
use tokio::time::timeout;

const SETTLE: Duration = Duration::from_secs(5);

async fn collect_exchange(
    events: &mut mpsc::UnboundedReceiver<EndpointEvent>,
    expected_request_id: &str,
) -> (Vec<i64>, Vec<ResendResponseKind>) {
    let mut unicasts = Vec::new();
    let mut responses = Vec::new();
    timeout(SETTLE, async {
        loop {
            let Some(event) = events.recv().await else {
                panic!("endpoint closed");
            };
            let EndpointEvent::MessageReceived { payload, .. } = event else {
                continue;
            };
            match NodeToNode::decode(&payload).unwrap() {
                NodeControlMessage::Unicast {
                    request_id,
                    message,
                } => {
                    assert_eq!(request_id, expected_request_id);
                    unicasts.push(message.id.timestamp);
                }
                NodeControlMessage::ResendResponse {
                    request_id, kind, ..
                } => {
                    assert_eq!(request_id, expected_request_id);
                    responses.push(kind);
                    if matches!(
                        kind,
                        ResendResponseKind::Resent | ResendResponseKind::NoResend
                    ) {
                        return;
                    }
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await
    .expect("resend exchange never finished");
    (unicasts, responses)
}

#[tokio::test]
async fn storage_node_serves_resend_last_requests() {
    setup_logging();

    let store = Arc::new(MemoryMessageStore::new());
    for timestamp in [1, 2, 3] {
        store
            .insert(message("history", 0, timestamp, 0, "publisher"))
            .await;
    }
    let storage = Node::start(
        node_config("storageNode", 34600, Vec::new()).with_message_store(store),
    )
    .await
    .unwrap();
    storage.subscribe("history", 0).await.unwrap();

    let (requester, mut events) =
        Endpoint::start(EndpointConfig::new(PeerInfo::node("requester"), "127.0.0.1", 34601))
            .await
            .unwrap();
    let adapter = NodeToNode::new(requester.clone());
    let peer = requester.connect("ws://127.0.0.1:34600").await.unwrap();
    assert_eq!(peer, "storageNode");

    // The request id is minted at send time.
    let request = ResendRequest {
        request_id: String::new(),
        stream_key: StreamKey::new("history", 0),
        kind: ResendKind::Last { number_last: 2 },
    };
    let request_id = adapter.send_resend_request(&peer, &request).await.unwrap();
    assert!(!request_id.is_empty());

    let (unicasts, responses) = collect_exchange(&mut events, &request_id).await;
    assert_eq!(unicasts, vec![2, 3]);
    assert_eq!(
        responses,
        vec![ResendResponseKind::Resending, ResendResponseKind::Resent]
    );

    // A stream with no history answers with a bare NoResend.
    let empty = ResendRequest {
        request_id: "empty-request".to_string(),
        stream_key: StreamKey::new("nothing-here", 0),
        kind: ResendKind::Last { number_last: 5 },
    };
    let request_id = adapter.send_resend_request(&peer, &empty).await.unwrap();
    assert_eq!(request_id, "empty-request");
    let (unicasts, responses) = collect_exchange(&mut events, &request_id).await;
    assert!(unicasts.is_empty());
    assert_eq!(responses, vec![ResendResponseKind::NoResend]);

    requester.stop().await;
    storage.shutdown().await;
}
