//! Downstream and upstream message envelopes.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{InboundFrame, ATTR_CATEGORY, ATTR_FROM, ATTR_MESSAGE_ID};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Payload attribute selecting what the backend should do with an upstream message
pub const PAYLOAD_ACTION: &str = "action";
/// Payload attribute naming the forwarding target of a `MESSAGE` action
pub const PAYLOAD_RECIPIENT: &str = "recipient";
/// Payload attribute carrying human readable text
pub const PAYLOAD_MESSAGE: &str = "message";

/// Reply to the sender
pub const ACTION_ECHO: &str = "ECHO";
/// Forward to the recipient named in the payload
pub const ACTION_MESSAGE: &str = "MESSAGE";

/// Downstream message envelope sent to the server.
///
/// Optional fields are omitted from the JSON when unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Registration token, topic or group of the target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Unique id of this message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Application data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,
    /// Display notification payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<HashMap<String, String>>,
    /// Topic condition expression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Collapse key for coalescing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    /// Delivery priority ("normal" or "high")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Wake an idle client app
    #[serde(skip_serializing_if = "is_false", default)]
    pub content_available: bool,
    /// Time to live in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u32>,
    /// Ask the server for a delivery receipt
    #[serde(skip_serializing_if = "is_false", default)]
    pub delivery_receipt_requested: bool,
    /// Validate without delivering
    #[serde(skip_serializing_if = "is_false", default)]
    pub dry_run: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl OutgoingMessage {
    /// Message with a target, an id and a data payload
    pub fn new(
        to: impl Into<String>,
        message_id: impl Into<String>,
        data: HashMap<String, String>,
    ) -> Self {
        Self {
            to: Some(to.into()),
            message_id: Some(message_id.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Same envelope addressed to another target under a new id
    pub fn readdressed(&self, to: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            to: Some(to.into()),
            message_id: Some(message_id.into()),
            ..self.clone()
        }
    }

    /// Encode as a JSON string
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Upstream message sent by a device through the server.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamMessage {
    /// Sender registration token
    pub from: String,
    /// Package name of the sending application
    pub category: Option<String>,
    /// Server-assigned id, echoed back in our ack
    pub message_id: String,
    /// Application data
    pub data: HashMap<String, String>,
}

impl UpstreamMessage {
    /// Extract an upstream message from a frame without `message_type`
    pub fn from_frame(frame: &InboundFrame) -> ProtocolResult<Self> {
        let from = frame
            .str_attr(ATTR_FROM)
            .ok_or(ProtocolError::MissingAttribute(ATTR_FROM))?
            .to_string();
        let message_id = frame
            .str_attr(ATTR_MESSAGE_ID)
            .ok_or(ProtocolError::MissingAttribute(ATTR_MESSAGE_ID))?
            .to_string();

        Ok(Self {
            from,
            category: frame.str_attr(ATTR_CATEGORY).map(str::to_string),
            message_id,
            data: frame.data()?,
        })
    }

    /// Value of the `action` payload attribute
    pub fn action(&self) -> Option<&str> {
        self.data.get(PAYLOAD_ACTION).map(String::as_str)
    }
}

/// Build the JSON ack for an upstream message
pub fn ack_json(to: &str, message_id: &str) -> String {
    let mut map = Map::new();
    map.insert("message_type".to_string(), Value::from("ack"));
    map.insert("to".to_string(), Value::from(to));
    map.insert("message_id".to_string(), Value::from(message_id));
    Value::Object(map).to_string()
}

/// Generate a unique message id of the form `m-<yyyyMMddHHmmss>-<uuid>`
pub fn unique_message_id() -> String {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    format!("m-{}-{}", stamp, uuid::Uuid::new_v4())
}
