//! Encoding and decoding of JSON envelopes.
//!
//! Frames travel as single JSON objects. This module turns raw text into
//! [`InboundFrame`]s and provides a small builder for ad-hoc envelopes
//! (auth lines, test fixtures).

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::InboundFrame;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::trace;

/// Decode one JSON object into a frame
pub fn decode_frame(raw: &str) -> ProtocolResult<InboundFrame> {
    let trimmed = raw.trim();
    match serde_json::from_str::<Value>(trimmed)? {
        Value::Object(attributes) => {
            trace!("Decoded frame with {} attributes", attributes.len());
            Ok(InboundFrame::new(trimmed.to_string(), attributes))
        }
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Builder for a flat JSON envelope
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    map: Map<String, Value>,
}

impl EnvelopeBuilder {
    /// Create an empty envelope
    pub fn new() -> Self {
        Self { map: Map::new() }
    }

    /// Insert a string attribute
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map.insert(key.to_string(), Value::from(value));
        self
    }

    /// Insert a string map attribute (e.g. `data`)
    pub fn insert_map(mut self, key: &str, value: &HashMap<String, String>) -> Self {
        let object = value
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect::<Map<String, Value>>();
        self.map.insert(key.to_string(), Value::Object(object));
        self
    }

    /// Render as JSON text
    pub fn build(self) -> String {
        Value::Object(self.map).to_string()
    }

    /// Render as an inbound frame
    pub fn into_frame(self) -> InboundFrame {
        InboundFrame::from_attributes(self.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MessageType;

    #[test]
    fn test_decode_object() {
        let frame = decode_frame(" {\"message_type\":\"ack\",\"message_id\":\"m1\"}\n").unwrap();
        assert_eq!(frame.message_type(), MessageType::Ack);
        assert_eq!(frame.message_id(), Some("m1"));
        assert_eq!(frame.raw(), "{\"message_type\":\"ack\",\"message_id\":\"m1\"}");
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(matches!(decode_frame("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(decode_frame("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_builder_round_trips_through_decoder() {
        let mut data = HashMap::new();
        data.insert("action".to_string(), "ECHO".to_string());
        let text = EnvelopeBuilder::new()
            .insert_str("from", "u1")
            .insert_str("message_id", "up-1")
            .insert_map("data", &data)
            .build();

        let frame = decode_frame(&text).unwrap();
        assert_eq!(frame.message_type(), MessageType::Upstream);
        assert_eq!(frame.sender(), Some("u1"));
        assert_eq!(frame.data().unwrap(), data);
    }
}
