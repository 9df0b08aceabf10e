// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed protocol adapters over the WebSocket endpoint.
//!
//! Two thin layers translate between opaque byte frames and tagged control
//! messages: [`NodeToNode`] for traffic between nodes and [`TrackerProtocol`]
//! for the tracker leg, with a sending side for each role. Requests minted
//! without an identifier get a fresh UUID at send time.

use streamr_protocol::{
    codec, mint_request_id, NodeControlMessage, ProtocolError, ResendResponseKind, Status,
    StreamKey, StreamMessage, TrackerControlMessage,
};

use crate::endpoint::{Endpoint, EndpointError};
use crate::resend::{ResendKind, ResendRequest};

fn encode_frame<T: serde::Serialize>(
    peer_id: &str,
    message: &T,
) -> Result<Vec<u8>, EndpointError> {
    codec::encode(message).map_err(|err| EndpointError::SendFailed {
        peer_id: peer_id.to_string(),
        reason: err.to_string(),
    })
}

/// Node↔node control traffic.
#[derive(Clone, Debug)]
pub struct NodeToNode {
    endpoint: Endpoint,
}

impl NodeToNode {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn decode(payload: &[u8]) -> Result<NodeControlMessage, ProtocolError> {
        codec::decode_node_message(payload)
    }

    async fn send(
        &self,
        peer_id: &str,
        message: &NodeControlMessage,
    ) -> Result<(), EndpointError> {
        let frame = encode_frame(peer_id, message)?;
        self.endpoint.send(peer_id, frame).await.map(|_| ())
    }

    pub async fn send_broadcast(
        &self,
        peer_id: &str,
        message: &StreamMessage,
    ) -> Result<(), EndpointError> {
        self.send(
            peer_id,
            &NodeControlMessage::Broadcast {
                message: message.clone(),
            },
        )
        .await
    }

    pub async fn send_unicast(
        &self,
        peer_id: &str,
        request_id: &str,
        message: StreamMessage,
    ) -> Result<(), EndpointError> {
        self.send(
            peer_id,
            &NodeControlMessage::Unicast {
                request_id: request_id.to_string(),
                message,
            },
        )
        .await
    }

    pub async fn send_subscribe(
        &self,
        peer_id: &str,
        stream_key: &StreamKey,
    ) -> Result<(), EndpointError> {
        self.send(
            peer_id,
            &NodeControlMessage::Subscribe {
                stream_key: stream_key.clone(),
            },
        )
        .await
    }

    pub async fn send_unsubscribe(
        &self,
        peer_id: &str,
        stream_key: &StreamKey,
    ) -> Result<(), EndpointError> {
        self.send(
            peer_id,
            &NodeControlMessage::Unsubscribe {
                stream_key: stream_key.clone(),
            },
        )
        .await
    }

    /// Send a historical-message request, minting a request id when the
    /// caller supplied none. Returns the id actually used.
    pub async fn send_resend_request(
        &self,
        peer_id: &str,
        request: &ResendRequest,
    ) -> Result<String, EndpointError> {
        let request_id = if request.request_id.is_empty() {
            mint_request_id()
        } else {
            request.request_id.clone()
        };
        let message = match &request.kind {
            ResendKind::Last { number_last } => NodeControlMessage::ResendLast {
                request_id: request_id.clone(),
                stream_key: request.stream_key.clone(),
                number_last: *number_last,
            },
            ResendKind::From {
                from,
                publisher_id,
                msg_chain_id,
            } => NodeControlMessage::ResendFrom {
                request_id: request_id.clone(),
                stream_key: request.stream_key.clone(),
                from: *from,
                publisher_id: publisher_id.clone(),
                msg_chain_id: msg_chain_id.clone(),
            },
            ResendKind::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            } => NodeControlMessage::ResendRange {
                request_id: request_id.clone(),
                stream_key: request.stream_key.clone(),
                from: *from,
                to: *to,
                publisher_id: publisher_id.clone(),
                msg_chain_id: msg_chain_id.clone(),
            },
        };
        self.send(peer_id, &message).await?;
        Ok(request_id)
    }

    pub async fn send_resend_response(
        &self,
        peer_id: &str,
        request_id: &str,
        stream_key: &StreamKey,
        kind: ResendResponseKind,
    ) -> Result<(), EndpointError> {
        self.send(
            peer_id,
            &NodeControlMessage::ResendResponse {
                request_id: request_id.to_string(),
                stream_key: stream_key.clone(),
                kind,
            },
        )
        .await
    }
}

/// Node→tracker control traffic.
#[derive(Clone, Debug)]
pub struct NodeToTracker {
    endpoint: Endpoint,
}

impl NodeToTracker {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn decode(payload: &[u8]) -> Result<TrackerControlMessage, ProtocolError> {
        codec::decode_tracker_message(payload)
    }

    pub async fn send_status(&self, tracker_id: &str, status: &Status) -> Result<(), EndpointError> {
        let frame = encode_frame(
            tracker_id,
            &TrackerControlMessage::Status {
                status: status.clone(),
            },
        )?;
        self.endpoint.send(tracker_id, frame).await.map(|_| ())
    }

    pub async fn send_storage_nodes_request(
        &self,
        tracker_id: &str,
        stream_key: &StreamKey,
    ) -> Result<(), EndpointError> {
        let frame = encode_frame(
            tracker_id,
            &TrackerControlMessage::StorageNodesRequest {
                stream_key: stream_key.clone(),
            },
        )?;
        self.endpoint.send(tracker_id, frame).await.map(|_| ())
    }
}

/// Tracker→node control traffic.
#[derive(Clone, Debug)]
pub struct TrackerToNode {
    endpoint: Endpoint,
}

impl TrackerToNode {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn decode(payload: &[u8]) -> Result<TrackerControlMessage, ProtocolError> {
        codec::decode_tracker_message(payload)
    }

    pub async fn send_instruction(
        &self,
        node_id: &str,
        stream_key: &StreamKey,
        node_addresses: Vec<String>,
        counter: u64,
    ) -> Result<(), EndpointError> {
        let frame = encode_frame(
            node_id,
            &TrackerControlMessage::Instruction {
                stream_key: stream_key.clone(),
                node_addresses,
                counter,
            },
        )?;
        self.endpoint.send(node_id, frame).await.map(|_| ())
    }

    pub async fn send_storage_nodes_response(
        &self,
        node_id: &str,
        stream_key: &StreamKey,
        node_addresses: Vec<String>,
    ) -> Result<(), EndpointError> {
        let frame = encode_frame(
            node_id,
            &TrackerControlMessage::StorageNodesResponse {
                stream_key: stream_key.clone(),
                node_addresses,
            },
        )?;
        self.endpoint.send(node_id, frame).await.map(|_| ())
    }
}
