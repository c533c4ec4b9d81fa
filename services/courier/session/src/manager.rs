//! Session manager: connection lifecycle and reliable downstream delivery
//!
//! The [`SessionManager`] owns the message registry and the connection state.
//! It drives every send through a [`RetryPolicy`], feeds inbound frames to the
//! [`Dispatcher`], reconnects when a draining connection closes, and replays
//! undelivered messages once a connection authenticates.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticated -> Draining -> Disconnected
//!      ^              |                                          |
//!      +--- failed ---+                   (closed while draining) reconnect
//! ```

use crate::dispatcher::{Dispatcher, SessionOps};
use crate::error::{RetryError, SessionError, SessionResult, TransportError};
use crate::registry::{MessageRegistry, OutboundMessage};
use crate::retry::{BackoffConfig, RetryPolicy};
use crate::transport::{Transport, TransportEvent};
use courier_wire::{unique_message_id, OutgoingMessage};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default age after which an unacknowledged transmitted message is replayed
pub const DEFAULT_REPLAY_GRACE: Duration = Duration::from_millis(5000);

/// Session configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Backoff for message and ack sends
    pub send_backoff: BackoffConfig,
    /// Backoff for reconnection
    pub reconnect_backoff: BackoffConfig,
    /// Awaiting-ack entries younger than this are not replayed
    pub replay_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_backoff: BackoffConfig::message_send(),
            reconnect_backoff: BackoffConfig::reconnect(),
            replay_grace: DEFAULT_REPLAY_GRACE,
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection
    Disconnected,
    /// Connecting or logging in
    Connecting,
    /// Logged in and sending
    Authenticated,
    /// Server announced the connection will close; sends are held back
    Draining,
}

/// Result of submitting a downstream message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport; awaiting ack
    Sent,
    /// Connection is draining; held for replay without a send attempt
    Deferred,
    /// Every attempt failed; moved to pending resend
    Requeued,
    /// Every attempt failed but an ack or nack arrived meanwhile
    Settled,
}

/// Notifications for the owner of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connection authenticated and replay was started
    Authenticated,
    /// Reconnection succeeded
    Reconnected {
        /// Attempts it took
        attempts: u32,
    },
    /// The connection closed without a prior drain signal
    ConnectionLost {
        /// Error reported with the close, if any
        reason: Option<String>,
    },
    /// Reconnection gave up; the session is dead
    ReconnectFailed {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last_error: TransportError,
    },
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    registry: MessageRegistry,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    reconnect_lock: Mutex<()>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Handle to one relay session. Cloning shares the session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("tracked", &self.inner.registry.len())
            .finish()
    }
}

impl SessionManager {
    /// Create a disconnected session over `transport`
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::with_dispatcher(config, transport, Dispatcher::new())
    }

    /// Create a session with a custom dispatcher
    pub fn with_dispatcher(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Dispatcher,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                transport,
                registry: MessageRegistry::new(),
                dispatcher,
                state,
                reconnect_lock: Mutex::new(()),
                cancel: CancellationToken::new(),
                events,
            }),
        };
        (manager, events_rx)
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// True while a connection is authenticated, draining or not
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Authenticated | ConnectionState::Draining
        )
    }

    /// The message registry
    pub fn registry(&self) -> &MessageRegistry {
        &self.inner.registry
    }

    /// Connect and log in once, then replay undelivered messages
    pub async fn connect(&self) -> SessionResult<()> {
        self.establish().await?;
        self.replay();
        Ok(())
    }

    /// Track `payload` under `id` and send it with retries.
    ///
    /// While draining the message is only tracked; it goes out with the
    /// replay after reconnection.
    pub async fn send_downstream(
        &self,
        id: impl Into<String>,
        payload: impl Into<String>,
    ) -> SessionResult<SendOutcome> {
        let message = OutboundMessage::new(id, payload);
        match self.enqueue(message) {
            Some((id, payload)) => self.transmit(&id, &payload).await,
            None => Ok(SendOutcome::Deferred),
        }
    }

    /// Send an ack frame with retries; dropped if every attempt fails
    pub async fn send_ack(&self, payload: impl AsRef<str>) -> SessionResult<()> {
        match self.send_with_retry(payload.as_ref()).await {
            Ok(()) => Ok(()),
            Err(RetryError::Cancelled) => Err(SessionError::Shutdown),
            Err(e) => {
                warn!("Dropping ack after failed retries: {}", e);
                Err(SessionError::SendFailed(e))
            }
        }
    }

    /// Send `message` to every recipient, each with a fresh message id
    pub async fn send_broadcast(
        &self,
        message: &OutgoingMessage,
        recipients: &[String],
    ) -> SessionResult<Vec<(String, SendOutcome)>> {
        let mut envelopes = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let id = unique_message_id();
            let payload = message.readdressed(recipient.as_str(), id.as_str()).to_json()?;
            envelopes.push((id, payload));
        }
        debug!("Broadcasting to {} recipients", envelopes.len());

        let sends = envelopes.into_iter().map(|(id, payload)| async move {
            let outcome = self.send_downstream(id.clone(), payload).await?;
            Ok::<_, SessionError>((id, outcome))
        });
        join_all(sends).await.into_iter().collect()
    }

    /// Re-establish the connection under the reconnect backoff, then replay.
    ///
    /// Backoff sequences are serialized. A caller arriving while another one
    /// runs waits for it; if that left the session down, the caller runs its
    /// own sequence. Replay starts after the lock is released.
    pub async fn reconnect(&self) -> SessionResult<()> {
        {
            let _guard = match self.inner.reconnect_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Reconnection already in progress, joining");
                    let guard = self.inner.reconnect_lock.lock().await;
                    if self.is_alive() {
                        return Ok(());
                    }
                    debug!("Joined reconnection left the session down, retrying");
                    guard
                }
            };
            self.reestablish().await?;
        }

        self.replay();
        Ok(())
    }

    /// Resubmit undelivered messages in enqueue order.
    ///
    /// Pending-resend entries go first, then awaiting-ack entries outside the
    /// grace window. Entries acknowledged since the snapshot are skipped. Each
    /// message is tracked immediately and sent by its own task, spawned in
    /// enqueue order. Returns the number of messages resubmitted.
    pub fn replay(&self) -> usize {
        let candidates = self
            .inner
            .registry
            .replay_candidates(self.inner.config.replay_grace);
        if candidates.is_empty() {
            return 0;
        }
        info!("Replaying {} message(s)", candidates.len());

        let mut replayed = 0;
        for tracked in candidates {
            let message = match self.inner.registry.take(&tracked.message.id, tracked.slot) {
                Some(message) => message,
                None => {
                    debug!("Message {} settled before replay", tracked.message.id);
                    continue;
                }
            };
            replayed += 1;
            let Some((id, payload)) = self.enqueue(message) else {
                continue;
            };
            let this = self.clone();
            tokio::spawn(async move {
                match this.transmit(&id, &payload).await {
                    Ok(outcome) => debug!("Replayed message {}: {:?}", id, outcome),
                    Err(e) => debug!("Replay of {} ended: {}", id, e),
                }
            });
        }
        replayed
    }

    /// Consume transport events until shutdown or the channel closes.
    ///
    /// Returns an error if a reconnection it started is exhausted.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> SessionResult<()> {
        info!("Session event loop started");
        let mut reconnecting: Option<JoinHandle<SessionResult<()>>> = None;

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    info!("Session event loop stopping");
                    return Ok(());
                }
                result = join_task(&mut reconnecting), if reconnecting.is_some() => {
                    reconnecting = None;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e @ SessionError::ReconnectExhausted { .. })) => return Err(e),
                        Ok(Err(SessionError::Shutdown)) => return Ok(()),
                        Ok(Err(e)) => warn!("Reconnection ended: {}", e),
                        Err(e) => warn!("Reconnection task failed: {}", e),
                    }
                }
                event = events.recv() => {
                    let event = match event {
                        Some(event) => event,
                        None => {
                            info!("Transport event channel closed");
                            return Ok(());
                        }
                    };
                    if let Some(task) = self.handle_transport_event(event) {
                        // The newer reconnection outlives or joins the older one
                        if reconnecting.replace(task).is_some() {
                            debug!("Following the newer reconnection");
                        }
                    }
                }
            }
        }
    }

    /// Apply one transport event.
    ///
    /// Returns the reconnection task when a draining connection closed.
    pub fn handle_transport_event(
        &self,
        event: TransportEvent,
    ) -> Option<JoinHandle<SessionResult<()>>> {
        match event {
            TransportEvent::Connected => {
                debug!("Transport connected");
                None
            }
            TransportEvent::Authenticated => {
                self.on_authenticated();
                None
            }
            TransportEvent::Frame(frame) => {
                match self.inner.dispatcher.dispatch(&frame, self) {
                    Ok(disposition) => debug!("Dispatched frame: {:?}", disposition),
                    Err(e) => warn!("Discarding frame: {} ({})", e, frame.raw()),
                }
                None
            }
            TransportEvent::Closed => self.on_closed(None),
            TransportEvent::ClosedOnError(reason) => self.on_closed(Some(reason)),
            TransportEvent::ReconnectFailed(reason) => {
                warn!("Transport reconnection failed: {}", reason);
                None
            }
        }
    }

    /// Close the connection; the close event still flows through the lifecycle
    pub async fn disconnect_gracefully(&self) {
        info!("Disconnecting gracefully");
        self.inner.transport.disconnect().await;
    }

    /// Stop the event loop, interrupt backoff waits and disconnect
    pub async fn shutdown(&self) {
        info!("Shutting down session");
        self.inner.cancel.cancel();
        self.inner.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Backoff loop of one reconnection; the caller holds the reconnect lock
    async fn reestablish(&self) -> SessionResult<()> {
        let mut policy = RetryPolicy::new(self.inner.config.reconnect_backoff);
        let mut attempts = 0;
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(SessionError::Shutdown);
            }
            attempts += 1;

            let last_error = match self.establish().await {
                Ok(()) => {
                    policy.on_success();
                    info!("Reconnected after {} attempt(s)", attempts);
                    self.emit(SessionEvent::Reconnected { attempts });
                    return Ok(());
                }
                Err(e) => e,
            };
            warn!("Reconnection attempt {} failed: {}", attempts, last_error);

            match policy.on_failure(&self.inner.cancel).await {
                Ok(()) => {}
                Err(RetryError::Cancelled) => return Err(SessionError::Shutdown),
                Err(RetryError::Exhausted { attempts, .. }) => {
                    self.set_state(ConnectionState::Disconnected);
                    error!(
                        "Reconnection failed after {} attempts: {}",
                        attempts, last_error
                    );
                    self.emit(SessionEvent::ReconnectFailed {
                        attempts,
                        last_error: last_error.clone(),
                    });
                    return Err(SessionError::ReconnectExhausted {
                        attempts,
                        last_error,
                    });
                }
            }
        }
    }

    async fn establish(&self) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);
        let transport = &self.inner.transport;
        let result = match transport.connect().await {
            Ok(()) => transport.login().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        self.set_state(ConnectionState::Authenticated);
        info!("Session authenticated");
        self.emit(SessionEvent::Authenticated);
        Ok(())
    }

    /// Record the message; returns what to transmit unless draining
    fn enqueue(&self, message: OutboundMessage) -> Option<(String, String)> {
        let id = message.id.clone();
        let payload = message.payload.clone();
        self.inner.registry.track(message);

        if self.state() == ConnectionState::Draining {
            debug!("Connection draining, holding message {} for replay", id);
            return None;
        }
        self.inner.registry.mark_transmitted(&id);
        Some((id, payload))
    }

    async fn transmit(&self, id: &str, payload: &str) -> SessionResult<SendOutcome> {
        match self.send_with_retry(payload).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(RetryError::Cancelled) => {
                self.inner.registry.defer(id);
                Err(SessionError::Shutdown)
            }
            Err(e) => {
                if self.inner.registry.defer(id) {
                    warn!("Message {} queued for resend: {}", id, e);
                    Ok(SendOutcome::Requeued)
                } else {
                    Ok(SendOutcome::Settled)
                }
            }
        }
    }

    async fn send_with_retry(&self, payload: &str) -> Result<(), RetryError> {
        let config = self.inner.config.send_backoff;
        let mut policy = RetryPolicy::new(config);
        while policy.should_retry() {
            match self.inner.transport.send(payload).await {
                Ok(()) => {
                    policy.on_success();
                    return Ok(());
                }
                Err(e) => {
                    debug!("Send failed: {}", e);
                    policy.on_failure(&self.inner.cancel).await?;
                }
            }
        }
        Err(RetryError::Exhausted {
            attempts: config.max_attempts,
            last_wait: policy.current_wait(),
        })
    }

    fn on_authenticated(&self) {
        let adopted = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Authenticated;
                true
            } else {
                false
            }
        });
        if !adopted {
            return;
        }

        info!("Transport re-authenticated, replaying");
        self.emit(SessionEvent::Authenticated);
        self.replay();
    }

    fn on_closed(&self, reason: Option<String>) -> Option<JoinHandle<SessionResult<()>>> {
        let mut previous = ConnectionState::Disconnected;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            match state {
                ConnectionState::Authenticated | ConnectionState::Draining => {
                    *state = ConnectionState::Disconnected;
                    true
                }
                _ => false,
            }
        });

        match previous {
            ConnectionState::Draining => {
                info!("Draining connection closed, reconnecting");
                let this = self.clone();
                Some(tokio::spawn(async move { this.reconnect().await }))
            }
            ConnectionState::Authenticated => {
                warn!("Connection lost: {}", reason.as_deref().unwrap_or("closed"));
                self.emit(SessionEvent::ConnectionLost { reason });
                None
            }
            _ => {
                debug!("Close event while {:?}", previous);
                None
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Session event receiver dropped");
        }
    }
}

impl SessionOps for SessionManager {
    fn acknowledge(&self, message_id: &str) {
        if self.inner.registry.acknowledge(message_id).is_none() {
            debug!("Ack for unknown message {}", message_id);
        }
    }

    fn mark_draining(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Authenticated {
                *state = ConnectionState::Draining;
                true
            } else {
                false
            }
        });
        if !changed {
            debug!("Drain signal while {:?}", self.state());
        }
    }

    fn submit_ack(&self, payload: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.send_ack(payload).await;
        });
    }

    fn submit_downstream(&self, message_id: String, payload: String) {
        let Some((id, payload)) = self.enqueue(OutboundMessage::new(message_id, payload)) else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.transmit(&id, &payload).await {
                debug!("Send of {} ended: {}", id, e);
            }
        });
    }
}

async fn join_task<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Slot;
    use crate::transport::mock::MockTransport;
    use courier_wire::{decode_frame, InboundFrame};
    use serde_json::Value;
    use std::collections::HashMap;

    fn session(
        transport: &Arc<MockTransport>,
    ) -> (SessionManager, mpsc::UnboundedReceiver<SessionEvent>) {
        SessionManager::new(SessionConfig::default(), transport.clone())
    }

    fn frame(raw: &str) -> TransportEvent {
        TransportEvent::Frame(decode_frame(raw).unwrap())
    }

    fn draining() -> TransportEvent {
        frame(r#"{"message_type":"control","control_type":"CONNECTION_DRAINING"}"#)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_send_tracks_until_ack() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Authenticated);

        let outcome = manager.send_downstream("m1", "{\"to\":\"u1\"}").await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(transport.sent(), vec!["{\"to\":\"u1\"}"]);
        assert!(manager.registry().contains("m1", Slot::AwaitingAck));

        manager.handle_transport_event(frame(r#"{"message_type":"ack","message_id":"m1"}"#));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ack_is_noop() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        manager.send_downstream("m1", "{}").await.unwrap();

        manager.handle_transport_event(frame(r#"{"message_type":"ack","message_id":"other"}"#));
        assert_eq!(manager.registry().len(), 1);
        assert!(manager.registry().contains("m1", Slot::AwaitingAck));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_send_moves_to_pending() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        transport.fail_all_sends(true);

        let outcome = manager.send_downstream("m1", "{}").await.unwrap();
        assert_eq!(outcome, SendOutcome::Requeued);
        assert!(manager.registry().contains("m1", Slot::PendingResend));
        assert_eq!(manager.registry().awaiting_ack_len(), 0);
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_recovers_within_budget() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        transport.fail_next_sends(2);

        let outcome = manager.send_downstream("m1", "{}").await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert!(manager.registry().contains("m1", Slot::AwaitingAck));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_during_retries_settles() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        transport.fail_all_sends(true);

        let sender = manager.clone();
        let send = tokio::spawn(async move { sender.send_downstream("m1", "{}").await });
        settle().await;
        manager.handle_transport_event(frame(r#"{"message_type":"ack","message_id":"m1"}"#));

        assert_eq!(send.await.unwrap().unwrap(), SendOutcome::Settled);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_is_dropped() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        transport.fail_all_sends(true);

        assert!(matches!(
            manager.send_ack("{}").await,
            Err(SessionError::SendFailed(RetryError::Exhausted { attempts: 3, .. }))
        ));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_device_nack_clears_without_reconnect() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        manager.send_downstream("m1", "{}").await.unwrap();

        let task = manager.handle_transport_event(frame(
            r#"{"message_type":"nack","message_id":"m1","error":"DEVICE_UNREGISTERED"}"#,
        ));
        assert!(task.is_none());
        assert!(manager.registry().is_empty());
        assert_eq!(manager.state(), ConnectionState::Authenticated);
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_draining_defers_sends() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        manager.handle_transport_event(draining());
        assert_eq!(manager.state(), ConnectionState::Draining);
        assert!(manager.is_alive());

        let outcome = manager.send_downstream("m1", "{}").await.unwrap();
        assert_eq!(outcome, SendOutcome::Deferred);
        assert!(transport.sent().is_empty());
        assert!(manager.registry().contains("m1", Slot::AwaitingAck));
    }

    #[tokio::test]
    async fn test_draining_nack_sets_draining() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        manager.handle_transport_event(frame(
            r#"{"message_type":"nack","message_id":"x","error":"CONNECTION_DRAINING"}"#,
        ));
        assert_eq!(manager.state(), ConnectionState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_then_close_reconnects_and_replays_in_order() {
        let transport = MockTransport::connected();
        let (manager, mut events) = session(&transport);
        manager.connect().await.unwrap();

        transport.fail_all_sends(true);
        assert_eq!(
            manager.send_downstream("m0", "p0").await.unwrap(),
            SendOutcome::Requeued
        );
        transport.fail_all_sends(false);
        assert_eq!(manager.send_downstream("m1", "p1").await.unwrap(), SendOutcome::Sent);

        tokio::time::advance(Duration::from_millis(10)).await;
        manager.handle_transport_event(draining());
        assert_eq!(
            manager.send_downstream("m2", "p2").await.unwrap(),
            SendOutcome::Deferred
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        transport.clear_sent();
        transport.drop_connection();
        drain_events(&mut events);

        let task = manager
            .handle_transport_event(TransportEvent::Closed)
            .expect("reconnect task");
        task.await.unwrap().unwrap();
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Authenticated);
        assert_eq!(transport.connect_calls(), 2);
        assert_eq!(transport.sent(), vec!["p0", "p1", "p2"]);
        assert_eq!(manager.registry().awaiting_ack_len(), 3);
        assert_eq!(manager.registry().pending_resend_len(), 0);
        assert!(drain_events(&mut events).contains(&SessionEvent::Reconnected { attempts: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_sends_exhaust_back_to_pending_in_order() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        transport.fail_all_sends(true);
        for i in 0..3 {
            let outcome = manager
                .send_downstream(format!("m{}", i), format!("p{}", i))
                .await
                .unwrap();
            assert_eq!(outcome, SendOutcome::Requeued);
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        manager.handle_transport_event(draining());
        transport.clear_sent();
        let task = manager.handle_transport_event(TransportEvent::Closed).unwrap();
        task.await.unwrap().unwrap();
        settle().await;

        // Each replayed send failed once and is now backing off on its own
        assert_eq!(transport.attempts(), vec!["p0", "p1", "p2"]);
        assert_eq!(manager.registry().awaiting_ack_len(), 3);
        assert!(manager.inner.reconnect_lock.try_lock().is_ok());

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.attempts().len(), 9);
        assert!(transport.sent().is_empty());
        assert_eq!(manager.registry().pending_resend_len(), 3);
        let order: Vec<String> = manager
            .registry()
            .snapshot(Slot::PendingResend)
            .into_iter()
            .map(|tracked| tracked.message.id)
            .collect();
        assert_eq!(order, vec!["m0", "m1", "m2"]);
        assert_eq!(manager.state(), ConnectionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_then_close_during_replay_reconnects_again() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        transport.fail_all_sends(true);
        assert_eq!(
            manager.send_downstream("m0", "p0").await.unwrap(),
            SendOutcome::Requeued
        );

        manager.handle_transport_event(draining());
        let first = manager.handle_transport_event(TransportEvent::Closed).unwrap();
        first.await.unwrap().unwrap();
        settle().await;
        // The replay of m0 is retrying on a link that rejects sends
        assert!(manager.registry().contains("m0", Slot::AwaitingAck));

        manager.handle_transport_event(draining());
        let second = manager.handle_transport_event(TransportEvent::Closed).unwrap();
        transport.fail_all_sends(false);
        second.await.unwrap().unwrap();

        assert_eq!(manager.state(), ConnectionState::Authenticated);
        assert_eq!(transport.connect_calls(), 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.sent(), vec!["p0"]);
        assert!(manager.registry().contains("m0", Slot::AwaitingAck));
        assert_eq!(manager.registry().pending_resend_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_send_not_replayed_within_grace() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        manager.send_downstream("m1", "p1").await.unwrap();

        manager.handle_transport_event(draining());
        transport.clear_sent();
        let task = manager.handle_transport_event(TransportEvent::Closed).unwrap();
        task.await.unwrap().unwrap();

        assert!(transport.sent().is_empty());
        assert!(manager.registry().contains("m1", Slot::AwaitingAck));
    }

    #[tokio::test]
    async fn test_unexpected_close_is_not_retried() {
        let transport = MockTransport::connected();
        let (manager, mut events) = session(&transport);
        manager.connect().await.unwrap();
        drain_events(&mut events);

        let task =
            manager.handle_transport_event(TransportEvent::ClosedOnError("reset".to_string()));
        assert!(task.is_none());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_alive());
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(
            drain_events(&mut events),
            vec![SessionEvent::ConnectionLost {
                reason: Some("reset".to_string())
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_band_authentication_replays() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        transport.fail_all_sends(true);
        manager.send_downstream("m1", "p1").await.unwrap();
        manager.handle_transport_event(TransportEvent::Closed);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        transport.fail_all_sends(false);
        manager.handle_transport_event(TransportEvent::Authenticated);
        assert_eq!(manager.state(), ConnectionState::Authenticated);
        settle().await;

        assert_eq!(transport.sent(), vec!["p1"]);
        assert!(manager.registry().contains("m1", Slot::AwaitingAck));
    }

    #[tokio::test]
    async fn test_duplicate_authenticated_event_ignored() {
        let transport = MockTransport::connected();
        let (manager, mut events) = session(&transport);
        manager.connect().await.unwrap();
        drain_events(&mut events);

        manager.handle_transport_event(TransportEvent::Authenticated);
        assert!(drain_events(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers_after_failures() {
        let transport = Arc::new(MockTransport::default());
        let (manager, _events) = session(&transport);
        transport.fail_next_connects(2);

        manager.reconnect().await.unwrap();
        assert_eq!(transport.connect_calls(), 3);
        assert_eq!(manager.state(), ConnectionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_is_fatal() {
        let transport = Arc::new(MockTransport::default());
        let (manager, mut events) = session(&transport);
        transport.fail_next_connects(5);

        match manager.reconnect().await {
            Err(SessionError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(transport.connect_calls(), 5);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::ReconnectFailed { attempts: 5, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reconnects_join() {
        let transport = Arc::new(MockTransport::default());
        let (manager, _events) = session(&transport);
        transport.fail_next_connects(1);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconnect().await })
        };
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconnect().await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(transport.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_echo_acks_and_replies() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        manager.handle_transport_event(frame(
            r#"{"from":"u1","message_id":"up-1","data":{"action":"ECHO","message":"hi"}}"#,
        ));
        // The reply is tracked before its send task runs
        assert_eq!(manager.registry().awaiting_ack_len(), 1);
        settle().await;

        let sent: Vec<Value> = transport
            .sent()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect();
        assert_eq!(sent.len(), 2);
        let ack = sent.iter().find(|v| v["message_type"] == "ack").unwrap();
        assert_eq!(ack["to"], "u1");
        assert_eq!(ack["message_id"], "up-1");
        let reply = sent.iter().find(|v| v["message_type"].is_null()).unwrap();
        assert_eq!(reply["to"], "u1");
        assert_eq!(reply["data"]["message"], "hi");
    }

    #[tokio::test]
    async fn test_malformed_frame_discarded() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        let event = TransportEvent::Frame(InboundFrame::from_attributes(
            serde_json::from_str(r#"{"from":"u1","message_id":"up-1","data":{}}"#).unwrap(),
        ));
        assert!(manager.handle_transport_event(event).is_none());
        settle().await;
        assert!(transport.sent().is_empty());
        assert_eq!(manager.state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn test_broadcast_uses_fresh_ids() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        let mut data = HashMap::new();
        data.insert("message".to_string(), "hello".to_string());
        let message = OutgoingMessage::new("unused", "unused", data);
        let recipients = vec!["a".to_string(), "b".to_string()];

        let results = manager.send_broadcast(&message, &recipients).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, o)| *o == SendOutcome::Sent));
        assert_ne!(results[0].0, results[1].0);

        let sent: Vec<Value> = transport
            .sent()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect();
        let mut recipients: Vec<&str> = sent.iter().map(|v| v["to"].as_str().unwrap()).collect();
        recipients.sort();
        assert_eq!(recipients, vec!["a", "b"]);
        assert_eq!(manager.registry().awaiting_ack_len(), 2);
    }

    #[tokio::test]
    async fn test_state_watch() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        let mut state = manager.subscribe_state();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        manager.connect().await.unwrap();
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        tx.send(frame(r#"{"message_type":"receipt","message_id":"m1"}"#))
            .unwrap();
        manager.shutdown().await;

        handle.await.unwrap().unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        transport.fail_all_sends(true);

        let sender = manager.clone();
        let send = tokio::spawn(async move { sender.send_downstream("m1", "{}").await });
        settle().await;
        manager.shutdown().await;

        assert!(matches!(send.await.unwrap(), Err(SessionError::Shutdown)));
        assert!(manager.registry().contains("m1", Slot::PendingResend));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_reconnect_retries_after_exhaustion() {
        let transport = Arc::new(MockTransport::default());
        let (manager, _events) = session(&transport);
        transport.fail_next_connects(5);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconnect().await })
        };
        settle().await;
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconnect().await })
        };

        assert!(matches!(
            first.await.unwrap(),
            Err(SessionError::ReconnectExhausted { attempts: 5, .. })
        ));
        second.await.unwrap().unwrap();
        assert_eq!(transport.connect_calls(), 6);
        assert_eq!(manager.state(), ConnectionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_follows_newest_reconnection() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        manager.handle_transport_event(draining());
        transport.fail_next_connects(5);

        let (tx, rx) = mpsc::unbounded_channel();
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        tx.send(TransportEvent::Closed).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        // The transport recovers on its own while the first reconnection
        // backs off, then drains and closes again
        tx.send(TransportEvent::Authenticated).unwrap();
        tx.send(draining()).unwrap();
        tx.send(TransportEvent::Closed).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.state(), ConnectionState::Authenticated);
        assert_eq!(transport.connect_calls(), 7);
        assert!(!handle.is_finished());

        manager.shutdown().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_surfaces_reconnect_exhaustion() {
        let transport = MockTransport::connected();
        let (manager, _events) = session(&transport);
        manager.connect().await.unwrap();
        manager.handle_transport_event(draining());
        transport.fail_next_connects(5);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TransportEvent::Closed).unwrap();

        assert!(matches!(
            manager.run(rx).await,
            Err(SessionError::ReconnectExhausted { attempts: 5, .. })
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
