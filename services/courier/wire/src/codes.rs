//! Nack error codes and control types.

use std::fmt;

/// Classification of a nack error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The target device or request is permanently bad
    Device,
    /// Transient trouble on the server side
    Server,
    /// The server is about to close this connection
    Draining,
    /// Code not known to this client
    Unknown,
}

/// Error code carried in the `error` attribute of a nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed JSON or invalid field values
    InvalidJson,
    /// Registration token is invalid
    BadRegistration,
    /// Registration token no longer valid on the device
    DeviceUnregistered,
    /// Ack referenced an unknown or already acknowledged message
    BadAck,
    /// Topic message rate too high
    TopicsMessageRateExceeded,
    /// Per-device message rate too high
    DeviceMessageRateExceeded,
    /// Server temporarily unable to process
    ServiceUnavailable,
    /// Server internal failure
    InternalServerError,
    /// Connection is being drained
    ConnectionDraining,
    /// Anything else, kept verbatim
    Other(String),
}

impl ErrorCode {
    /// Parse a wire value. Unknown codes are preserved in [`ErrorCode::Other`].
    pub fn parse(code: &str) -> Self {
        match code {
            "INVALID_JSON" => Self::InvalidJson,
            "BAD_REGISTRATION" => Self::BadRegistration,
            "DEVICE_UNREGISTERED" => Self::DeviceUnregistered,
            "BAD_ACK" => Self::BadAck,
            "TOPICS_MESSAGE_RATE_EXCEEDED" => Self::TopicsMessageRateExceeded,
            "DEVICE_MESSAGE_RATE_EXCEEDED" => Self::DeviceMessageRateExceeded,
            "SERVICE_UNAVAILABLE" => Self::ServiceUnavailable,
            "INTERNAL_SERVER_ERROR" => Self::InternalServerError,
            "CONNECTION_DRAINING" => Self::ConnectionDraining,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidJson => "INVALID_JSON",
            Self::BadRegistration => "BAD_REGISTRATION",
            Self::DeviceUnregistered => "DEVICE_UNREGISTERED",
            Self::BadAck => "BAD_ACK",
            Self::TopicsMessageRateExceeded => "TOPICS_MESSAGE_RATE_EXCEEDED",
            Self::DeviceMessageRateExceeded => "DEVICE_MESSAGE_RATE_EXCEEDED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::ConnectionDraining => "CONNECTION_DRAINING",
            Self::Other(code) => code,
        }
    }

    /// How the session layer should react to this code
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidJson
            | Self::BadRegistration
            | Self::DeviceUnregistered
            | Self::BadAck
            | Self::TopicsMessageRateExceeded
            | Self::DeviceMessageRateExceeded => ErrorClass::Device,
            Self::ServiceUnavailable | Self::InternalServerError => ErrorClass::Server,
            Self::ConnectionDraining => ErrorClass::Draining,
            Self::Other(_) => ErrorClass::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `control_type` attribute of a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlType {
    /// Server will close this connection soon
    ConnectionDraining,
    /// Unrecognized control type
    Other(String),
}

impl ControlType {
    /// Parse a wire value
    pub fn parse(value: &str) -> Self {
        match value {
            "CONNECTION_DRAINING" => Self::ConnectionDraining,
            other => Self::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_classes() {
        for code in [
            "INVALID_JSON",
            "BAD_REGISTRATION",
            "DEVICE_UNREGISTERED",
            "BAD_ACK",
            "TOPICS_MESSAGE_RATE_EXCEEDED",
            "DEVICE_MESSAGE_RATE_EXCEEDED",
        ] {
            assert_eq!(ErrorCode::parse(code).class(), ErrorClass::Device, "{}", code);
        }

        assert_eq!(ErrorCode::parse("SERVICE_UNAVAILABLE").class(), ErrorClass::Server);
        assert_eq!(ErrorCode::parse("INTERNAL_SERVER_ERROR").class(), ErrorClass::Server);
        assert_eq!(ErrorCode::parse("CONNECTION_DRAINING").class(), ErrorClass::Draining);
        assert_eq!(ErrorCode::parse("QUOTA_GONE").class(), ErrorClass::Unknown);
    }

    #[test]
    fn test_unknown_code_kept_verbatim() {
        let code = ErrorCode::parse("SOMETHING_NEW");
        assert_eq!(code, ErrorCode::Other("SOMETHING_NEW".to_string()));
        assert_eq!(code.to_string(), "SOMETHING_NEW");
    }

    #[test]
    fn test_control_type() {
        assert_eq!(ControlType::parse("CONNECTION_DRAINING"), ControlType::ConnectionDraining);
        assert_eq!(ControlType::parse("PAUSE"), ControlType::Other("PAUSE".to_string()));
    }
}
