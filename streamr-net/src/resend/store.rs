// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pluggable source of historical messages.
//!
//! The network core does not persist messages itself; resend strategies
//! query whatever [`MessageStore`] implementation the embedding application
//! provides. [`MemoryMessageStore`] keeps everything in memory and is what
//! storage-typed nodes and the tests use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use streamr_protocol::{MessageRef, StreamKey, StreamMessage};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: StreamMessage);

    /// The `count` most recent messages of a stream, oldest first.
    async fn last(&self, stream: &StreamKey, count: usize) -> Vec<StreamMessage>;

    /// Messages within `[from, to]` (unbounded above when `to` is `None`),
    /// optionally filtered by publisher and message chain, oldest first.
    async fn range(
        &self,
        stream: &StreamKey,
        from: MessageRef,
        to: Option<MessageRef>,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> Vec<StreamMessage>;
}

/// In-memory store ordered by message reference per stream.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    inner: Arc<Mutex<HashMap<StreamKey, Vec<StreamMessage>>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: StreamMessage) {
        let Ok(mut streams) = self.inner.lock() else {
            return;
        };
        let messages = streams.entry(message.id.stream_key.clone()).or_default();
        let reference = message.id.reference();
        let position = messages.partition_point(|existing| existing.id.reference() <= reference);
        messages.insert(position, message);
    }

    async fn last(&self, stream: &StreamKey, count: usize) -> Vec<StreamMessage> {
        let Ok(streams) = self.inner.lock() else {
            return Vec::new();
        };
        streams
            .get(stream)
            .map(|messages| {
                let skip = messages.len().saturating_sub(count);
                messages[skip..].to_vec()
            })
            .unwrap_or_default()
    }

    async fn range(
        &self,
        stream: &StreamKey,
        from: MessageRef,
        to: Option<MessageRef>,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> Vec<StreamMessage> {
        let Ok(streams) = self.inner.lock() else {
            return Vec::new();
        };
        streams
            .get(stream)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|message| {
                        let reference = message.id.reference();
                        reference >= from
                            && to.map(|to| reference <= to).unwrap_or(true)
                            && publisher_id
                                .map(|publisher| message.id.publisher_id == publisher)
                                .unwrap_or(true)
                            && msg_chain_id
                                .map(|chain| message.id.msg_chain_id == chain)
                                .unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use streamr_protocol::{MessageId, MessageRef, StreamKey, StreamMessage};

    use super::{MemoryMessageStore, MessageStore};

    fn message(timestamp: i64, publisher: &str) -> StreamMessage {
        let id = MessageId::new(StreamKey::new("s", 0), timestamp, 0, publisher, "chain");
        StreamMessage::new(id, Vec::new())
    }

    #[tokio::test]
    async fn last_returns_most_recent_oldest_first() {
        let store = MemoryMessageStore::new();
        for timestamp in [30, 10, 20] {
            store.insert(message(timestamp, "p")).await;
        }
        let stream = StreamKey::new("s", 0);
        let last = store.last(&stream, 2).await;
        let timestamps: Vec<i64> = last.iter().map(|m| m.id.timestamp).collect();
        assert_eq!(timestamps, vec![20, 30]);
        assert_eq!(store.last(&stream, 10).await.len(), 3);
    }

    #[tokio::test]
    async fn range_respects_bounds_and_filters() {
        let store = MemoryMessageStore::new();
        store.insert(message(10, "a")).await;
        store.insert(message(20, "b")).await;
        store.insert(message(30, "a")).await;

        let stream = StreamKey::new("s", 0);
        let hits = store
            .range(&stream, MessageRef::new(10, 0), Some(MessageRef::new(20, 0)), None, None)
            .await;
        assert_eq!(hits.len(), 2);

        let filtered = store
            .range(&stream, MessageRef::new(0, 0), None, Some("a"), None)
            .await;
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|m| m.id.publisher_id == "a"));
    }
}
