// SPDX-License-Identifier: MIT OR Apache-2.0

//! CBOR codec for control-message frames.
//!
//! One WebSocket binary frame carries exactly one CBOR-encoded control
//! message, so no additional length framing is needed here.

use ciborium::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::control::{
    NodeControlMessage, TrackerControlMessage, NODE_MESSAGE_TAGS, TRACKER_MESSAGE_TAGS,
};

/// Errors which can occur while turning frames into control messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is valid CBOR but carries a control type we don't know.
    #[error("unknown control frame type: {0}")]
    UnknownFrame(String),

    /// The frame could not be decoded at all.
    #[error("malformed control frame: {0}")]
    MalformedPayload(String),
}

/// Encode a control message into a CBOR byte frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(message, &mut bytes)
        .map_err(|err| ProtocolError::MalformedPayload(err.to_string()))?;
    Ok(bytes)
}

/// Decode a node↔node control frame.
pub fn decode_node_message(bytes: &[u8]) -> Result<NodeControlMessage, ProtocolError> {
    decode_tagged(bytes, NODE_MESSAGE_TAGS)
}

/// Decode a tracker↔node control frame.
pub fn decode_tracker_message(bytes: &[u8]) -> Result<TrackerControlMessage, ProtocolError> {
    decode_tagged(bytes, TRACKER_MESSAGE_TAGS)
}

fn decode_tagged<T: DeserializeOwned>(
    bytes: &[u8],
    known_tags: &[&str],
) -> Result<T, ProtocolError> {
    match ciborium::de::from_reader(bytes) {
        Ok(message) => Ok(message),
        Err(err) => match frame_tag(bytes) {
            Some(tag) if !known_tags.contains(&tag.as_str()) => {
                Err(ProtocolError::UnknownFrame(tag))
            }
            _ => Err(ProtocolError::MalformedPayload(err.to_string())),
        },
    }
}

/// Read the `type` tag out of a CBOR map without deserializing the payload.
fn frame_tag(bytes: &[u8]) -> Option<String> {
    let value: Value = ciborium::de::from_reader(bytes).ok()?;
    let Value::Map(entries) = value else {
        return None;
    };
    entries.into_iter().find_map(|(key, value)| match (key, value) {
        (Value::Text(key), Value::Text(tag)) if key == "type" => Some(tag),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use ciborium::value::Value;

    use crate::control::{NodeControlMessage, Status, TrackerControlMessage};
    use crate::identifiers::{MessageId, StreamKey};
    use crate::messages::StreamMessage;

    use super::{decode_node_message, decode_tracker_message, encode, ProtocolError};

    fn message() -> StreamMessage {
        let id = MessageId::new(StreamKey::new("stream-1", 0), 1000, 0, "publisher", "chain");
        StreamMessage::new(id, b"payload".to_vec())
    }

    #[test]
    fn broadcast_round_trips() {
        let frame = NodeControlMessage::Broadcast { message: message() };
        let bytes = encode(&frame).unwrap();
        assert_eq!(decode_node_message(&bytes).unwrap(), frame);
    }

    #[test]
    fn status_round_trips() {
        let frame = TrackerControlMessage::Status {
            status: Status::default(),
        };
        let bytes = encode(&frame).unwrap();
        assert_eq!(decode_tracker_message(&bytes).unwrap(), frame);
    }

    #[test]
    fn unknown_tag_is_an_unknown_frame() {
        let alien = Value::Map(vec![(
            Value::Text("type".into()),
            Value::Text("teleport".into()),
        )]);
        let bytes = encode(&alien).unwrap();
        match decode_node_message(&bytes) {
            Err(ProtocolError::UnknownFrame(tag)) => assert_eq!(tag, "teleport"),
            other => panic!("expected unknown frame, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_node_message(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn known_tag_with_bad_fields_is_malformed() {
        let wrong = Value::Map(vec![(
            Value::Text("type".into()),
            Value::Text("subscribe".into()),
        )]);
        let bytes = encode(&wrong).unwrap();
        assert!(matches!(
            decode_node_message(&bytes),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }
}
