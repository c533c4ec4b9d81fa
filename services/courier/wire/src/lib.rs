//! JSON envelope types, frame classification, and error codes for courier.
//!
//! This crate describes what travels over the relay connection: inbound
//! frames (acks, nacks, receipts, control messages, upstream device
//! messages) and outbound envelopes (downstream messages and acks).
//!
//! ## Features
//!
//! - **Frame classification**: `message_type` mapped to [`MessageType`]
//! - **Error codes**: nack codes grouped into device, server and draining classes
//! - **Envelopes**: serde-backed downstream message with optional fields omitted
//! - **Message ids**: time-stamped unique ids for system-generated messages
//!
//! ## Envelope
//!
//! ```text
//! {
//!   "message_type": "ack" | "nack" | "receipt" | "control" | (absent),
//!   "message_id":   "m-20240101120000-<uuid>",
//!   "from" / "to":  "<registration token>",
//!   "data":         { "<key>": "<value>", ... },
//!   "error":        "DEVICE_UNREGISTERED",        (nack)
//!   "control_type": "CONNECTION_DRAINING"         (control)
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod codes;
pub mod error;
pub mod frame;
pub mod message;

// Re-export main types
pub use codec::{decode_frame, EnvelopeBuilder};
pub use codes::{ControlType, ErrorClass, ErrorCode};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{InboundFrame, MessageType};
pub use message::{
    ack_json, unique_message_id, OutgoingMessage, UpstreamMessage, ACTION_ECHO, ACTION_MESSAGE,
    PAYLOAD_ACTION, PAYLOAD_MESSAGE, PAYLOAD_RECIPIENT,
};
