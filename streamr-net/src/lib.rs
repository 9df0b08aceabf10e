// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracker-coordinated publish/subscribe overlay node.
//!
//! Producers publish ordered messages under a `(streamId, partition)` key;
//! subscribed nodes receive them through an overlay of direct WebSocket
//! connections. A tracker tells each node which peers to hold as forwarding
//! neighbours for every stream key; nodes converge on those instructions,
//! forward published messages to their neighbours and drop duplicates.
//!
//! The pieces, bottom up:
//!
//! - [`peer`]: peer identities and the peer book mapping ids to addresses
//! - [`endpoint`]: the WebSocket transport with its symmetric handshake,
//!   one socket per peer with duplicate tiebreaking, ping liveness and
//!   back-pressure signalling
//! - [`protocols`]: typed control-message adapters over the endpoint
//! - [`node`]: the subscription state machine and forwarding engine
//! - [`tracker`]: the topology manager issuing neighbour instructions
//! - [`resend`]: historical-message requests served by chained strategies
//! - [`metrics`]: recorded counters behind a queryable snapshot

pub mod endpoint;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod protocols;
pub mod resend;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod tracker;

pub use endpoint::{Endpoint, EndpointConfig, EndpointError, EndpointEvent};
pub use metrics::Metrics;
pub use node::{Node, NodeConfig, NodeError, NodeEvent};
pub use peer::{PeerBook, PeerError, PeerInfo, PeerType};
pub use resend::{
    LocalResendStrategy, MemoryMessageStore, MessageStore, ResendHandler, ResendRequest,
    ResendStrategy, ResendStream,
};
pub use tracker::{Tracker, TrackerConfig, TrackerError};
