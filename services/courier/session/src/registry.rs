//! Tracking of downstream messages awaiting acknowledgment or resend.
//!
//! Both registries live in one lock-striped map keyed by message id, with a
//! [`Slot`] per entry saying which registry it belongs to. An id therefore
//! occurs in at most one registry at any instant, and moving an entry between
//! them is a single update under the shard lock.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A downstream message as tracked for redelivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Unique message id
    pub id: String,
    /// Encoded envelope, opaque to the session layer
    pub payload: String,
    /// When the message was (re)submitted
    pub enqueued_at: Instant,
}

impl OutboundMessage {
    /// Stamp a new message with the current time
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            enqueued_at: Instant::now(),
        }
    }

    /// Time since submission
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Which registry an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Sent or about to be sent, no ack/nack yet
    AwaitingAck,
    /// Send exhausted its retries; resend on next connection
    PendingResend,
}

#[derive(Debug, Clone)]
struct Entry {
    message: OutboundMessage,
    slot: Slot,
    /// A transport send has been attempted for this entry
    transmitted: bool,
}

/// Snapshot of a tracked entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    /// The message
    pub message: OutboundMessage,
    /// Registry it was in when the snapshot was taken
    pub slot: Slot,
    /// Whether a send was attempted
    pub transmitted: bool,
}

/// Concurrent registry of unacknowledged downstream messages
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    entries: Arc<DashMap<String, Entry>>,
}

impl MessageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Record a message as awaiting acknowledgment.
    ///
    /// Replaces any previous entry with the same id, whichever registry it
    /// was in.
    pub fn track(&self, message: OutboundMessage) {
        debug!("Tracking message {} as awaiting ack", message.id);
        self.entries.insert(
            message.id.clone(),
            Entry {
                message,
                slot: Slot::AwaitingAck,
                transmitted: false,
            },
        );
    }

    /// Note that a transport send is about to be attempted
    pub fn mark_transmitted(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.transmitted = true;
        }
    }

    /// Drop a message after an ack or nack. Unknown ids are ignored.
    pub fn acknowledge(&self, id: &str) -> Option<OutboundMessage> {
        let removed = self.entries.remove(id).map(|(_, entry)| entry.message);
        if removed.is_some() {
            debug!("Message {} acknowledged and removed", id);
        }
        removed
    }

    /// Move a message from awaiting-ack to pending-resend.
    ///
    /// Returns false if the id is no longer awaiting ack (for instance an ack
    /// arrived while the send was retrying).
    pub fn defer(&self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) if entry.slot == Slot::AwaitingAck => {
                entry.slot = Slot::PendingResend;
                debug!("Message {} moved to pending resend", id);
                true
            }
            _ => false,
        }
    }

    /// Remove a message for replay, only if it is still in `slot`
    pub fn take(&self, id: &str, slot: Slot) -> Option<OutboundMessage> {
        self.entries
            .remove_if(id, |_, entry| entry.slot == slot)
            .map(|(_, entry)| entry.message)
    }

    /// Registry currently holding `id`
    pub fn slot_of(&self, id: &str) -> Option<Slot> {
        self.entries.get(id).map(|entry| entry.slot)
    }

    /// Whether `id` is tracked in `slot`
    pub fn contains(&self, id: &str, slot: Slot) -> bool {
        self.slot_of(id) == Some(slot)
    }

    /// Snapshot of one registry ordered by ascending enqueue time
    pub fn snapshot(&self, slot: Slot) -> Vec<TrackedMessage> {
        let mut snapshot: Vec<TrackedMessage> = self
            .entries
            .iter()
            .filter(|entry| entry.slot == slot)
            .map(|entry| TrackedMessage {
                message: entry.message.clone(),
                slot: entry.slot,
                transmitted: entry.transmitted,
            })
            .collect();
        snapshot.sort_by_key(|tracked| tracked.message.enqueued_at);
        snapshot
    }

    /// Messages to resubmit after (re)connection, in replay order.
    ///
    /// All pending-resend entries come first. Awaiting-ack entries follow if
    /// they were never transmitted or are older than `grace`, so that an ack
    /// still in flight for a recent send is not raced.
    pub fn replay_candidates(&self, grace: Duration) -> Vec<TrackedMessage> {
        let mut candidates = self.snapshot(Slot::PendingResend);
        candidates.extend(
            self.snapshot(Slot::AwaitingAck)
                .into_iter()
                .filter(|tracked| !tracked.transmitted || tracked.message.age() >= grace),
        );
        candidates
    }

    /// Entries awaiting acknowledgment
    pub fn awaiting_ack_len(&self) -> usize {
        self.count(Slot::AwaitingAck)
    }

    /// Entries pending resend
    pub fn pending_resend_len(&self) -> usize {
        self.count(Slot::PendingResend)
    }

    /// Total tracked entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn count(&self, slot: Slot) -> usize {
        self.entries.iter().filter(|entry| entry.slot == slot).count()
    }
}
