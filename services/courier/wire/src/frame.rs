//! Inbound frame representation.
//!
//! A frame is kept both as the raw JSON text it arrived as and as a parsed
//! attribute map. The session layer only looks at attributes through the
//! accessors below.

use crate::codes::{ControlType, ErrorCode};
use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Attribute naming the frame kind
pub const ATTR_MESSAGE_TYPE: &str = "message_type";
/// Attribute carrying the message id
pub const ATTR_MESSAGE_ID: &str = "message_id";
/// Sender address
pub const ATTR_FROM: &str = "from";
/// Recipient address
pub const ATTR_TO: &str = "to";
/// Application payload
pub const ATTR_DATA: &str = "data";
/// Nack error code
pub const ATTR_ERROR: &str = "error";
/// Nack error description
pub const ATTR_ERROR_DESCRIPTION: &str = "error_description";
/// Control frame type
pub const ATTR_CONTROL_TYPE: &str = "control_type";
/// Upstream category (application package)
pub const ATTR_CATEGORY: &str = "category";

/// Kind of an inbound frame, selected by the `message_type` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// No `message_type`: a normal upstream message from a device
    Upstream,
    /// Positive acknowledgment of a downstream message
    Ack,
    /// Negative acknowledgment of a downstream message
    Nack,
    /// Delivery receipt
    Receipt,
    /// Connection control message
    Control,
    /// Any other value
    Unknown(String),
}

impl MessageType {
    /// Classify a `message_type` value; `None` means the attribute was absent
    pub fn from_attribute(value: Option<&str>) -> Self {
        match value {
            None => Self::Upstream,
            Some("ack") => Self::Ack,
            Some("nack") => Self::Nack,
            Some("receipt") => Self::Receipt,
            Some("control") => Self::Control,
            Some(other) => Self::Unknown(other.to_string()),
        }
    }
}

/// One inbound protocol unit.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    raw: String,
    attributes: Map<String, Value>,
}

impl InboundFrame {
    /// Build a frame from its raw text and the already parsed attributes
    pub fn new(raw: String, attributes: Map<String, Value>) -> Self {
        Self { raw, attributes }
    }

    /// Build a frame from attributes alone, rendering the raw text
    pub fn from_attributes(attributes: Map<String, Value>) -> Self {
        let raw = Value::Object(attributes.clone()).to_string();
        Self { raw, attributes }
    }

    /// Raw JSON text as received
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Full attribute map
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// String attribute, if present and a string
    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Frame kind
    pub fn message_type(&self) -> MessageType {
        MessageType::from_attribute(self.str_attr(ATTR_MESSAGE_TYPE))
    }

    /// `message_id` attribute
    pub fn message_id(&self) -> Option<&str> {
        self.str_attr(ATTR_MESSAGE_ID)
    }

    /// `from` attribute
    pub fn sender(&self) -> Option<&str> {
        self.str_attr(ATTR_FROM)
    }

    /// Parsed nack error code
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.str_attr(ATTR_ERROR).map(ErrorCode::parse)
    }

    /// Nack error description
    pub fn error_description(&self) -> Option<&str> {
        self.str_attr(ATTR_ERROR_DESCRIPTION)
    }

    /// Parsed control type
    pub fn control_type(&self) -> Option<ControlType> {
        self.str_attr(ATTR_CONTROL_TYPE).map(ControlType::parse)
    }

    /// `data` attribute as a string map.
    ///
    /// Absent data yields an empty map. Non-string values are rendered as
    /// their JSON text.
    pub fn data(&self) -> ProtocolResult<HashMap<String, String>> {
        match self.attributes.get(ATTR_DATA) {
            None | Some(Value::Null) => Ok(HashMap::new()),
            Some(Value::Object(map)) => Ok(map
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()),
            Some(other) => Err(ProtocolError::InvalidAttribute {
                name: ATTR_DATA,
                reason: format!("expected object, got {}", other),
            }),
        }
    }
}
