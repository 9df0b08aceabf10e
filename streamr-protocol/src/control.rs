// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control messages exchanged between peers.
//!
//! Two tagged unions, one per direction: [`NodeControlMessage`] travels
//! between nodes, [`TrackerControlMessage`] between a node and its tracker.
//! Handlers match on the tag; unknown tags surface as
//! [`crate::ProtocolError::UnknownFrame`] at the codec.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identifiers::{MessageRef, StreamKey};
use crate::messages::StreamMessage;

/// Mint a fresh request identifier.
///
/// Requests put on the wire without an id get one of these at send time.
pub fn mint_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Terminal and progress markers of a resend exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendResponseKind {
    /// Historical messages will follow as unicasts.
    Resending,
    /// All requested messages have been sent.
    Resent,
    /// No strategy could produce any messages.
    NoResend,
}

/// Messages exchanged between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeControlMessage {
    /// A published message fanned out through the overlay.
    Broadcast { message: StreamMessage },
    /// A historical message directed at one requester.
    Unicast {
        request_id: String,
        message: StreamMessage,
    },
    Subscribe {
        stream_key: StreamKey,
    },
    Unsubscribe {
        stream_key: StreamKey,
    },
    ResendLast {
        request_id: String,
        stream_key: StreamKey,
        number_last: u64,
    },
    ResendFrom {
        request_id: String,
        stream_key: StreamKey,
        from: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
    ResendRange {
        request_id: String,
        stream_key: StreamKey,
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
    ResendResponse {
        request_id: String,
        stream_key: StreamKey,
        kind: ResendResponseKind,
    },
}

/// Wire tags of [`NodeControlMessage`], used by the codec to tell unknown
/// frames apart from malformed ones.
pub(crate) const NODE_MESSAGE_TAGS: &[&str] = &[
    "broadcast",
    "unicast",
    "subscribe",
    "unsubscribe",
    "resend_last",
    "resend_from",
    "resend_range",
    "resend_response",
];

/// Messages exchanged between a node and a tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerControlMessage {
    /// Periodic node report driving overlay reconciliation.
    Status { status: Status },
    /// The neighbour set a node should converge to for one stream key.
    Instruction {
        stream_key: StreamKey,
        node_addresses: Vec<String>,
        counter: u64,
    },
    StorageNodesRequest {
        stream_key: StreamKey,
    },
    StorageNodesResponse {
        stream_key: StreamKey,
        node_addresses: Vec<String>,
    },
}

/// Wire tags of [`TrackerControlMessage`].
pub(crate) const TRACKER_MESSAGE_TAGS: &[&str] = &[
    "status",
    "instruction",
    "storage_nodes_request",
    "storage_nodes_response",
];

/// Per-stream neighbour report within a [`Status`].
///
/// `counter` echoes the last instruction counter the node accepted for the
/// key, so the tracker can tell which instruction a report reflects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub inbound: Vec<String>,
    pub outbound: Vec<String>,
    pub counter: u64,
}

/// Full node report, keyed by the canonical stream key form.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub streams: HashMap<String, StreamStatus>,
    /// Round-trip estimates per connected peer, in milliseconds.
    #[serde(default)]
    pub rtts: HashMap<String, u64>,
}
