// SPDX-License-Identifier: MIT OR Apache-2.0

//! Historical-message resends.
//!
//! Incoming resend requests are fulfilled by walking an ordered list of
//! [`ResendStrategy`] implementations; the answer flows back to the
//! requester as a pausable, cancellable [`ResendStream`].

mod handler;
mod store;
mod strategies;
mod stream;

use std::time::Duration;

use streamr_protocol::{MessageRef, NodeControlMessage, StreamKey};
use thiserror::Error;

pub use handler::{ResendHandler, DEFAULT_MAX_INACTIVITY_PERIOD};
pub use store::{MemoryMessageStore, MessageStore};
pub use strategies::{LocalResendStrategy, ResendStrategy};
pub use stream::{resend_channel, ResendProducer, ResendStream};

#[derive(Debug, Error)]
pub enum ResendError {
    #[error("resend strategy failed: {0}")]
    Strategy(String),

    #[error("resend strategy produced nothing for {0:?}")]
    StrategyTimeout(Duration),

    #[error("resend was cancelled")]
    Cancelled,
}

/// What span of history a requester asked for.
#[derive(Clone, Debug, PartialEq)]
pub enum ResendKind {
    Last {
        number_last: u64,
    },
    From {
        from: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
    Range {
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
}

/// One historical-message request as the resend pipeline sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct ResendRequest {
    pub request_id: String,
    pub stream_key: StreamKey,
    pub kind: ResendKind,
}

impl ResendRequest {
    /// View a node control frame as a resend request, when it is one.
    pub fn from_control(message: &NodeControlMessage) -> Option<Self> {
        match message {
            NodeControlMessage::ResendLast {
                request_id,
                stream_key,
                number_last,
            } => Some(Self {
                request_id: request_id.clone(),
                stream_key: stream_key.clone(),
                kind: ResendKind::Last {
                    number_last: *number_last,
                },
            }),
            NodeControlMessage::ResendFrom {
                request_id,
                stream_key,
                from,
                publisher_id,
                msg_chain_id,
            } => Some(Self {
                request_id: request_id.clone(),
                stream_key: stream_key.clone(),
                kind: ResendKind::From {
                    from: *from,
                    publisher_id: publisher_id.clone(),
                    msg_chain_id: msg_chain_id.clone(),
                },
            }),
            NodeControlMessage::ResendRange {
                request_id,
                stream_key,
                from,
                to,
                publisher_id,
                msg_chain_id,
            } => Some(Self {
                request_id: request_id.clone(),
                stream_key: stream_key.clone(),
                kind: ResendKind::Range {
                    from: *from,
                    to: *to,
                    publisher_id: publisher_id.clone(),
                    msg_chain_id: msg_chain_id.clone(),
                },
            }),
            _ => None,
        }
    }
}
