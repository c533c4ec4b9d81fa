//! Reliable downstream delivery over a single relay connection.
//!
//! This crate keeps track of every downstream message until the server acks
//! or nacks it, retries sends with bounded exponential backoff, reacts to
//! connection draining by reconnecting, and replays undelivered messages
//! once the new connection authenticates.
//!
//! ## Features
//!
//! - **Message registry**: awaiting-ack and pending-resend tracking on a concurrent map
//! - **Retry policy**: doubling backoff with jitter, cancellable waits
//! - **Dispatcher**: ack/nack/receipt/control/upstream frame routing
//! - **Lifecycle**: connect, drain, reconnect and replay in [`SessionManager`]
//! - **Line transport**: newline-delimited JSON over TCP
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_session::{
//!     LineTransport, LineTransportConfig, SessionConfig, SessionEvent, SessionManager,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (transport_tx, transport_rx) = mpsc::unbounded_channel();
//! let transport = Arc::new(LineTransport::new(
//!     LineTransportConfig {
//!         server_addr: "127.0.0.1:5236".to_string(),
//!         username: "1234@gcm.googleapis.com".to_string(),
//!         api_key: "key".to_string(),
//!     },
//!     transport_tx,
//! ));
//!
//! let (session, mut events) = SessionManager::new(SessionConfig::default(), transport);
//! session.connect().await?;
//!
//! let runner = session.clone();
//! tokio::spawn(async move { runner.run(transport_rx).await });
//!
//! session.send_downstream("m-1", r#"{"to":"token","message_id":"m-1"}"#).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::ReconnectFailed { attempts, .. } = event {
//!         println!("Gave up after {} attempts", attempts);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod transport;

// Re-export main types
pub use dispatcher::{DeliveryHook, Dispatcher, Disposition, ForwardToRecipient, SessionOps};
pub use error::{RetryError, SessionError, SessionResult, TransportError};
pub use manager::{
    ConnectionState, SendOutcome, SessionConfig, SessionEvent, SessionManager,
    DEFAULT_REPLAY_GRACE,
};
pub use registry::{MessageRegistry, OutboundMessage, Slot, TrackedMessage};
pub use retry::{BackoffConfig, RetryPolicy, DEFAULT_MAX_JITTER};
pub use transport::{LineTransport, LineTransportConfig, Transport, TransportEvent};
