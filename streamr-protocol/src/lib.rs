// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire types for the streamr publish/subscribe network.
//!
//! Everything a node or tracker puts on the wire lives here: stream and
//! message identifiers, the two tagged control-message unions (node↔node and
//! tracker↔node) and the CBOR codec which turns them into byte frames.
//!
//! The crate is I/O-free on purpose. Transports live in `streamr-net`; this
//! crate only defines the shapes they exchange, so the encoding stays
//! swappable at the edge of the system.

pub mod codec;
pub mod control;
pub mod identifiers;
pub mod messages;

pub use codec::{decode_node_message, decode_tracker_message, encode, ProtocolError};
pub use control::{
    mint_request_id, NodeControlMessage, ResendResponseKind, Status, StreamStatus,
    TrackerControlMessage,
};
pub use identifiers::{IdentifierError, MessageId, MessageRef, StreamKey};
pub use messages::{SignatureEnvelope, StreamMessage};
