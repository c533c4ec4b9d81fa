//! Wire protocol error types.

use thiserror::Error;

/// Errors raised while decoding or interpreting a frame.
///
/// A protocol error is never retried: the offending frame is logged and
/// discarded by the caller.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame body is not valid JSON
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame body is JSON but not an object
    #[error("frame is not a json object")]
    NotAnObject,

    /// Required attribute is absent
    #[error("missing attribute: {0}")]
    MissingAttribute(&'static str),

    /// Attribute is present but has the wrong shape
    #[error("invalid attribute {name}: {reason}")]
    InvalidAttribute {
        /// Attribute name
        name: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

/// Result alias for wire operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
