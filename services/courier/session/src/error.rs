//! Session error types.

use courier_wire::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connecting or logging in failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Send attempted without a live connection
    #[error("not connected")]
    NotConnected,

    /// I/O failure on an established connection
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Outcome of a failed retry step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Every attempt failed
    #[error("retry failed: total of attempts {attempts}, last wait {last_wait:?}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Wait that would have followed
        last_wait: Duration,
    },

    /// The session is shutting down
    #[error("retry cancelled")]
    Cancelled,
}

/// Errors surfaced by the session manager.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed inbound frame
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A guarded send gave up
    #[error("send failed: {0}")]
    SendFailed(RetryError),

    /// Reconnection backoff exhausted; the session is dead
    #[error("reconnection failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last_error: TransportError,
    },

    /// The session has been shut down
    #[error("session shut down")]
    Shutdown,
}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
