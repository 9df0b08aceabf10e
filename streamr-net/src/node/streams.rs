// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-stream bookkeeping for one node.
//!
//! Tracks, for every subscribed stream key, the inbound neighbours messages
//! are accepted from, the outbound neighbours messages are forwarded to, the
//! last delivered message reference per `(publisher, msgChain)` chain and
//! the last accepted instruction counter.

use std::collections::{HashMap, HashSet};

use streamr_protocol::{MessageRef, StreamKey, StreamMessage, StreamStatus};
use tracing::debug;

#[derive(Debug, Default)]
struct StreamState {
    inbound: HashSet<String>,
    outbound: HashSet<String>,
    last_msg_by_chain: HashMap<(String, String), MessageRef>,
    counter: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StreamManager {
    streams: HashMap<StreamKey, StreamState>,
}

impl StreamManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a stream key. Returns true when the key is new.
    pub(crate) fn set_up(&mut self, stream: &StreamKey) -> bool {
        if self.streams.contains_key(stream) {
            return false;
        }
        self.streams.insert(stream.clone(), StreamState::default());
        true
    }

    pub(crate) fn is_set_up(&self, stream: &StreamKey) -> bool {
        self.streams.contains_key(stream)
    }

    /// Drop a stream key entirely; returns the neighbours that were attached
    /// to it, for unsubscribe notification.
    pub(crate) fn remove(&mut self, stream: &StreamKey) -> Option<Vec<String>> {
        self.streams.remove(stream).map(|state| {
            state
                .inbound
                .union(&state.outbound)
                .cloned()
                .collect::<Vec<_>>()
        })
    }

    pub(crate) fn keys(&self) -> Vec<StreamKey> {
        self.streams.keys().cloned().collect()
    }

    pub(crate) fn add_inbound(&mut self, stream: &StreamKey, peer_id: &str) -> bool {
        self.streams
            .get_mut(stream)
            .map(|state| state.inbound.insert(peer_id.to_string()))
            .unwrap_or(false)
    }

    pub(crate) fn is_inbound(&self, stream: &StreamKey, peer_id: &str) -> bool {
        self.streams
            .get(stream)
            .map(|state| state.inbound.contains(peer_id))
            .unwrap_or(false)
    }

    pub(crate) fn add_outbound(&mut self, stream: &StreamKey, peer_id: &str) -> bool {
        self.streams
            .get_mut(stream)
            .map(|state| state.outbound.insert(peer_id.to_string()))
            .unwrap_or(false)
    }

    pub(crate) fn remove_outbound(&mut self, stream: &StreamKey, peer_id: &str) {
        if let Some(state) = self.streams.get_mut(stream) {
            state.outbound.remove(peer_id);
        }
    }

    /// Remove the peer from both directions of one stream.
    pub(crate) fn remove_neighbour(&mut self, stream: &StreamKey, peer_id: &str) {
        if let Some(state) = self.streams.get_mut(stream) {
            state.inbound.remove(peer_id);
            state.outbound.remove(peer_id);
        }
    }

    pub(crate) fn outbound(&self, stream: &StreamKey) -> Vec<String> {
        self.streams
            .get(stream)
            .map(|state| state.outbound.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn counter(&self, stream: &StreamKey) -> u64 {
        self.streams
            .get(stream)
            .map(|state| state.counter)
            .unwrap_or(0)
    }

    pub(crate) fn set_counter(&mut self, stream: &StreamKey, counter: u64) {
        if let Some(state) = self.streams.get_mut(stream) {
            state.counter = counter;
        }
    }

    /// Duplicate and ordering gate.
    ///
    /// Accepts a message only when it advances its chain's last reference in
    /// strict `(timestamp, sequence_number)` order; duplicates and
    /// out-of-order arrivals are rejected. Returns false as well for streams
    /// we do not carry.
    pub(crate) fn mark_and_check(&mut self, message: &StreamMessage) -> bool {
        let Some(state) = self.streams.get_mut(&message.id.stream_key) else {
            return false;
        };
        let reference = message.id.reference();
        let chain = message.id.chain();
        if let Some(last) = state.last_msg_by_chain.get(&chain).copied() {
            if reference <= last {
                return false;
            }
            if let Some(prev) = message.prev_msg_ref {
                if prev > last {
                    debug!(
                        stream = %message.id.stream_key,
                        publisher = %message.id.publisher_id,
                        "gap detected in message chain"
                    );
                }
            }
        }
        state.last_msg_by_chain.insert(chain, reference);
        true
    }

    /// Strip a disconnected peer everywhere; returns the streams whose
    /// neighbour sets changed.
    pub(crate) fn remove_peer(&mut self, peer_id: &str) -> Vec<StreamKey> {
        let mut changed = Vec::new();
        for (stream, state) in self.streams.iter_mut() {
            let removed = state.inbound.remove(peer_id) | state.outbound.remove(peer_id);
            if removed {
                changed.push(stream.clone());
            }
        }
        changed
    }

    /// True when the peer is a neighbour on any stream.
    pub(crate) fn has_shared_streams(&self, peer_id: &str) -> bool {
        self.streams.values().any(|state| {
            state.inbound.contains(peer_id) || state.outbound.contains(peer_id)
        })
    }

    /// Wire-form status report, keyed by canonical stream key.
    pub(crate) fn status(&self) -> HashMap<String, StreamStatus> {
        self.streams
            .iter()
            .map(|(stream, state)| {
                let mut inbound: Vec<String> = state.inbound.iter().cloned().collect();
                let mut outbound: Vec<String> = state.outbound.iter().cloned().collect();
                inbound.sort();
                outbound.sort();
                (
                    stream.to_string(),
                    StreamStatus {
                        inbound,
                        outbound,
                        counter: state.counter,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use streamr_protocol::{MessageId, MessageRef, StreamKey, StreamMessage};

    use super::StreamManager;

    fn message(timestamp: i64, sequence_number: u32) -> StreamMessage {
        let id = MessageId::new(
            StreamKey::new("stream", 0),
            timestamp,
            sequence_number,
            "publisher",
            "chain",
        );
        StreamMessage::new(id, b"data".to_vec())
    }

    #[test]
    fn set_up_is_idempotent() {
        let mut manager = StreamManager::new();
        let stream = StreamKey::new("stream", 0);
        assert!(manager.set_up(&stream));
        assert!(!manager.set_up(&stream));
        assert_eq!(manager.keys(), vec![stream]);
    }

    #[test]
    fn marks_fresh_messages_and_drops_the_rest() {
        let mut manager = StreamManager::new();
        manager.set_up(&StreamKey::new("stream", 0));

        assert!(manager.mark_and_check(&message(10, 0)));
        // Exact duplicate.
        assert!(!manager.mark_and_check(&message(10, 0)));
        // Out of order within the chain.
        assert!(!manager.mark_and_check(&message(9, 5)));
        assert!(!manager.mark_and_check(&message(10, 0)));
        // Same timestamp, later sequence number advances.
        assert!(manager.mark_and_check(&message(10, 1)));
        assert!(manager.mark_and_check(&message(11, 0)));
    }

    #[test]
    fn chains_are_independent() {
        let mut manager = StreamManager::new();
        let stream = StreamKey::new("stream", 0);
        manager.set_up(&stream);

        let other = StreamMessage::new(
            MessageId::new(stream.clone(), 5, 0, "other-publisher", "chain"),
            b"data".to_vec(),
        );
        assert!(manager.mark_and_check(&message(10, 0)));
        // Earlier timestamp, but a different chain.
        assert!(manager.mark_and_check(&other));
    }

    #[test]
    fn messages_for_unknown_streams_are_rejected() {
        let mut manager = StreamManager::new();
        assert!(!manager.mark_and_check(&message(10, 0)));
    }

    #[test]
    fn gap_bookkeeping_still_accepts() {
        let mut manager = StreamManager::new();
        manager.set_up(&StreamKey::new("stream", 0));
        assert!(manager.mark_and_check(&message(10, 0)));
        // prev_msg_ref points past the last seen reference: a gap, delivered anyway.
        let gapped = message(20, 0).with_prev_msg_ref(MessageRef::new(15, 0));
        assert!(manager.mark_and_check(&gapped));
    }

    #[test]
    fn remove_peer_reports_changed_streams() {
        let mut manager = StreamManager::new();
        let one = StreamKey::new("one", 0);
        let two = StreamKey::new("two", 0);
        manager.set_up(&one);
        manager.set_up(&two);
        manager.add_inbound(&one, "peer");
        manager.add_outbound(&one, "peer");
        manager.add_outbound(&two, "other");

        assert!(manager.has_shared_streams("peer"));
        let changed = manager.remove_peer("peer");
        assert_eq!(changed, vec![one.clone()]);
        assert!(!manager.has_shared_streams("peer"));
        assert!(manager.outbound(&one).is_empty());
    }
}
