// SPDX-License-Identifier: MIT OR Apache-2.0

//! Published messages as they travel between peers.

use serde::{Deserialize, Serialize};

use crate::identifiers::{MessageId, MessageRef};

/// Opaque signature carried alongside a message.
///
/// The network forwards signatures untouched; validation is the concern of
/// layers above the dissemination engine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub scheme: u32,
    pub signature: Vec<u8>,
}

/// One published message within a stream partition.
///
/// `prev_msg_ref` points at the previous message of the same
/// `(publisher, msgChain)` chain and is used only for duplicate and gap
/// bookkeeping.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub id: MessageId,
    pub prev_msg_ref: Option<MessageRef>,
    pub content: Vec<u8>,
    pub signature: Option<SignatureEnvelope>,
}

impl StreamMessage {
    pub fn new(id: MessageId, content: Vec<u8>) -> Self {
        Self {
            id,
            prev_msg_ref: None,
            content,
            signature: None,
        }
    }

    pub fn with_prev_msg_ref(mut self, prev: MessageRef) -> Self {
        self.prev_msg_ref = Some(prev);
        self
    }

    pub fn with_signature(mut self, signature: SignatureEnvelope) -> Self {
        self.signature = Some(signature);
        self
    }
}
