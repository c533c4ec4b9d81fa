//! Inbound frame classification and routing.
//!
//! The [`Dispatcher`] holds no session state. It decides what a frame means
//! and acts on it only through the [`SessionOps`] the session manager
//! exposes, so every registry mutation and drain transition stays owned by
//! the manager.

use courier_wire::{
    ack_json, unique_message_id, ControlType, ErrorClass, InboundFrame, MessageType,
    OutgoingMessage, ProtocolError, ProtocolResult, UpstreamMessage, ACTION_ECHO, ACTION_MESSAGE,
    PAYLOAD_ACTION, PAYLOAD_RECIPIENT,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Operations the dispatcher may perform on the session.
///
/// Registry and drain updates apply before the call returns; sends are
/// handed off and complete on their own.
pub trait SessionOps {
    /// Forget a downstream message after an ack or nack
    fn acknowledge(&self, message_id: &str);

    /// Record that the server is draining this connection
    fn mark_draining(&self);

    /// Send an untracked ack
    fn submit_ack(&self, payload: String);

    /// Send a tracked downstream message
    fn submit_downstream(&self, message_id: String, payload: String);
}

/// Decides where an upstream `MESSAGE` goes
pub trait DeliveryHook: Send + Sync {
    /// Downstream message to emit for `message`, if any
    fn route(&self, message: &UpstreamMessage) -> ProtocolResult<Option<OutgoingMessage>>;
}

/// Re-sends the payload to the `recipient` named in it
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardToRecipient;

impl DeliveryHook for ForwardToRecipient {
    fn route(&self, message: &UpstreamMessage) -> ProtocolResult<Option<OutgoingMessage>> {
        let recipient = message
            .data
            .get(PAYLOAD_RECIPIENT)
            .ok_or(ProtocolError::MissingAttribute(PAYLOAD_RECIPIENT))?;
        Ok(Some(OutgoingMessage::new(
            recipient.clone(),
            unique_message_id(),
            message.data.clone(),
        )))
    }
}

/// What a frame turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Positive ack for a downstream message
    Acked {
        /// Acknowledged id, if the frame carried one
        message_id: Option<String>,
    },
    /// Negative ack for a downstream message
    Nacked {
        /// Rejected id, if the frame carried one
        message_id: Option<String>,
        /// Error class, `None` when the code was missing
        class: Option<ErrorClass>,
    },
    /// Delivery receipt, not acted upon
    Receipt,
    /// Server announced connection draining via a control frame
    Draining,
    /// Control frame of an unknown type
    UnknownControl(String),
    /// Upstream device message
    Upstream {
        /// Its `action` payload attribute
        action: String,
    },
    /// Unrecognized `message_type`
    UnknownType(String),
}

/// Stateless inbound frame router
#[derive(Clone)]
pub struct Dispatcher {
    hook: Arc<dyn DeliveryHook>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher that forwards `MESSAGE` actions to the payload recipient
    pub fn new() -> Self {
        Self::with_hook(Arc::new(ForwardToRecipient))
    }

    /// Dispatcher with a custom delivery hook
    pub fn with_hook(hook: Arc<dyn DeliveryHook>) -> Self {
        Self { hook }
    }

    /// Classify `frame` and apply its effects through `ops`
    pub fn dispatch<O>(&self, frame: &InboundFrame, ops: &O) -> ProtocolResult<Disposition>
    where
        O: SessionOps + ?Sized,
    {
        match frame.message_type() {
            MessageType::Upstream => self.handle_upstream(frame, ops),
            MessageType::Ack => {
                let message_id = frame.message_id().map(str::to_string);
                if let Some(id) = &message_id {
                    ops.acknowledge(id);
                }
                Ok(Disposition::Acked { message_id })
            }
            MessageType::Nack => Ok(self.handle_nack(frame, ops)),
            MessageType::Receipt => {
                debug!("Delivery receipt for {:?}", frame.message_id());
                Ok(Disposition::Receipt)
            }
            MessageType::Control => self.handle_control(frame, ops),
            MessageType::Unknown(other) => {
                info!("Received unknown message type: {}", other);
                Ok(Disposition::UnknownType(other))
            }
        }
    }

    fn handle_upstream<O>(&self, frame: &InboundFrame, ops: &O) -> ProtocolResult<Disposition>
    where
        O: SessionOps + ?Sized,
    {
        let upstream = UpstreamMessage::from_frame(frame)?;
        let action = upstream
            .action()
            .ok_or(ProtocolError::MissingAttribute(PAYLOAD_ACTION))?
            .to_string();

        ops.submit_ack(ack_json(&upstream.from, &upstream.message_id));

        match action.as_str() {
            ACTION_ECHO => {
                let reply = OutgoingMessage::new(
                    upstream.from.clone(),
                    unique_message_id(),
                    upstream.data.clone(),
                );
                self.submit(reply, ops)?;
            }
            ACTION_MESSAGE => {
                if let Some(outgoing) = self.hook.route(&upstream)? {
                    self.submit(outgoing, ops)?;
                }
            }
            other => debug!("Ignoring upstream action {} from {}", other, upstream.from),
        }

        Ok(Disposition::Upstream { action })
    }

    fn handle_nack<O>(&self, frame: &InboundFrame, ops: &O) -> Disposition
    where
        O: SessionOps + ?Sized,
    {
        let message_id = frame.message_id().map(str::to_string);
        if let Some(id) = &message_id {
            ops.acknowledge(id);
        }

        let code = match frame.error_code() {
            Some(code) => code,
            None => {
                error!("Received nack without error code for {:?}", message_id);
                return Disposition::Nacked {
                    message_id,
                    class: None,
                };
            }
        };

        let description = frame.error_description().unwrap_or_default();
        let class = code.class();
        match class {
            ErrorClass::Device => {
                info!("Device error: {} -> {}", code, description);
            }
            // Not resent automatically; the message is already out of the registry
            ErrorClass::Server => {
                warn!("Server error: {} -> {}", code, description);
            }
            ErrorClass::Draining => {
                info!("Connection draining from nack");
                ops.mark_draining();
            }
            ErrorClass::Unknown => {
                info!("Received unknown error code: {}", code);
            }
        }

        Disposition::Nacked {
            message_id,
            class: Some(class),
        }
    }

    fn handle_control<O>(&self, frame: &InboundFrame, ops: &O) -> ProtocolResult<Disposition>
    where
        O: SessionOps + ?Sized,
    {
        match frame.control_type() {
            Some(ControlType::ConnectionDraining) => {
                info!("Connection draining from control message");
                ops.mark_draining();
                Ok(Disposition::Draining)
            }
            Some(ControlType::Other(other)) => {
                info!("Received unknown control message: {}", other);
                Ok(Disposition::UnknownControl(other))
            }
            None => Err(ProtocolError::MissingAttribute("control_type")),
        }
    }

    fn submit<O>(&self, mut outgoing: OutgoingMessage, ops: &O) -> ProtocolResult<()>
    where
        O: SessionOps + ?Sized,
    {
        let message_id = outgoing
            .message_id
            .get_or_insert_with(unique_message_id)
            .clone();
        ops.submit_downstream(message_id, outgoing.to_json()?);
        Ok(())
    }
}
