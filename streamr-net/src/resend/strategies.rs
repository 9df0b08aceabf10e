// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resend strategies.
//!
//! A strategy turns a historical-message request into a lazy sequence. The
//! handler walks an ordered list of them, falling through until one
//! produces messages.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::store::MessageStore;
use super::stream::{resend_channel, ResendStream};
use super::{ResendError, ResendKind, ResendRequest};

#[async_trait]
pub trait ResendStrategy: Send + Sync + fmt::Debug {
    /// Open the response sequence for one request.
    ///
    /// An empty sequence means the strategy has nothing; an error means it
    /// could not answer at all. Either way the handler moves on to the next
    /// strategy.
    async fn resend(&self, request: &ResendRequest) -> Result<ResendStream, ResendError>;
}

/// Serves resends from a local [`MessageStore`].
#[derive(Clone)]
pub struct LocalResendStrategy {
    store: Arc<dyn MessageStore>,
}

impl LocalResendStrategy {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for LocalResendStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalResendStrategy").finish_non_exhaustive()
    }
}

#[async_trait]
impl ResendStrategy for LocalResendStrategy {
    async fn resend(&self, request: &ResendRequest) -> Result<ResendStream, ResendError> {
        let messages = match &request.kind {
            ResendKind::Last { number_last } => {
                self.store
                    .last(&request.stream_key, *number_last as usize)
                    .await
            }
            ResendKind::From {
                from,
                publisher_id,
                msg_chain_id,
            } => {
                self.store
                    .range(
                        &request.stream_key,
                        *from,
                        None,
                        publisher_id.as_deref(),
                        msg_chain_id.as_deref(),
                    )
                    .await
            }
            ResendKind::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            } => {
                self.store
                    .range(
                        &request.stream_key,
                        *from,
                        Some(*to),
                        publisher_id.as_deref(),
                        msg_chain_id.as_deref(),
                    )
                    .await
            }
        };
        debug!(
            stream = %request.stream_key,
            count = messages.len(),
            "local resend strategy answering"
        );

        let (mut producer, stream) = resend_channel(64);
        tokio::spawn(async move {
            for message in messages {
                if producer.send(message).await.is_err() {
                    return;
                }
            }
        });
        Ok(stream)
    }
}
