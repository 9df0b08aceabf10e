// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifiers for streams, partitions and messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between stream id and partition in the canonical text form.
const KEY_SEPARATOR: &str = "::";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("malformed stream key: {0}")]
    MalformedStreamKey(String),
}

/// Identifies one logical substream: a stream id paired with a partition.
///
/// The canonical textual form `"<streamId>::<partition>"` is used as a map
/// key on the wire and in log and event payloads.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct StreamKey {
    id: String,
    partition: u32,
}

impl StreamKey {
    pub fn new(id: impl Into<String>, partition: u32) -> Self {
        Self {
            id: id.into(),
            partition,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.id, KEY_SEPARATOR, self.partition)
    }
}

impl FromStr for StreamKey {
    type Err = IdentifierError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || IdentifierError::MalformedStreamKey(value.to_string());
        let (id, partition) = value.rsplit_once(KEY_SEPARATOR).ok_or_else(malformed)?;
        if id.is_empty() {
            return Err(malformed());
        }
        let partition = partition.parse().map_err(|_| malformed())?;
        Ok(Self::new(id, partition))
    }
}

/// Position of a message within a `(publisher, msgChain)` chain.
///
/// Ordering is lexicographic over `(timestamp, sequence_number)`, which is
/// exactly the delivery order subscribers observe.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize, Default,
)]
pub struct MessageRef {
    pub timestamp: i64,
    pub sequence_number: u32,
}

impl MessageRef {
    pub fn new(timestamp: i64, sequence_number: u32) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.sequence_number)
    }
}

/// Globally unique message identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct MessageId {
    pub stream_key: StreamKey,
    pub timestamp: i64,
    pub sequence_number: u32,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl MessageId {
    pub fn new(
        stream_key: StreamKey,
        timestamp: i64,
        sequence_number: u32,
        publisher_id: impl Into<String>,
        msg_chain_id: impl Into<String>,
    ) -> Self {
        Self {
            stream_key,
            timestamp,
            sequence_number,
            publisher_id: publisher_id.into(),
            msg_chain_id: msg_chain_id.into(),
        }
    }

    /// The message's position within its chain.
    pub fn reference(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_number)
    }

    /// The `(publisher, msgChain)` pair this message belongs to.
    pub fn chain(&self) -> (String, String) {
        (self.publisher_id.clone(), self.msg_chain_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageRef, StreamKey};

    #[test]
    fn stream_key_canonical_form_round_trips() {
        let key = StreamKey::new("stream-1", 0);
        assert_eq!(key.to_string(), "stream-1::0");
        assert_eq!("stream-1::0".parse::<StreamKey>().unwrap(), key);
    }

    #[test]
    fn stream_key_with_separator_in_id() {
        let key: StreamKey = "sandbox::stream::7".parse().unwrap();
        assert_eq!(key.id(), "sandbox::stream");
        assert_eq!(key.partition(), 7);
    }

    #[test]
    fn malformed_stream_keys_are_rejected() {
        assert!("no-partition".parse::<StreamKey>().is_err());
        assert!("::4".parse::<StreamKey>().is_err());
        assert!("stream::minus".parse::<StreamKey>().is_err());
    }

    #[test]
    fn message_refs_order_lexicographically() {
        assert!(MessageRef::new(1, 5) < MessageRef::new(2, 0));
        assert!(MessageRef::new(2, 0) < MessageRef::new(2, 1));
        assert_eq!(MessageRef::new(3, 3), MessageRef::new(3, 3));
    }
}
