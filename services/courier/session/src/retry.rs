//! Bounded exponential backoff with jitter.
//!
//! A [`RetryPolicy`] is created fresh for each logical operation and
//! discarded afterwards. Waits are async and observe a cancellation token,
//! so a retrying send only occupies its own task.

use crate::error::RetryError;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound (exclusive) of the random jitter added after each wait
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Backoff parameters for one kind of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Wait after the first failure
    pub base_wait: Duration,
    /// Jitter is drawn from `[0, max_jitter)`
    pub max_jitter: Duration,
}

impl BackoffConfig {
    /// Policy for individual message and ack sends: 3 attempts, 1 s base
    pub fn message_send() -> Self {
        Self {
            max_attempts: 3,
            base_wait: Duration::from_secs(1),
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// Policy for re-establishing the connection: 5 attempts, 1 s base
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 5,
            base_wait: Duration::from_secs(1),
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::message_send()
    }
}

/// Per-operation backoff state
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: BackoffConfig,
    attempts_left: u32,
    current_wait: Duration,
}

impl RetryPolicy {
    /// Fresh policy with all attempts available
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts_left: config.max_attempts,
            current_wait: config.base_wait,
        }
    }

    /// True while attempts remain and no attempt has succeeded
    pub fn should_retry(&self) -> bool {
        self.attempts_left > 0
    }

    /// Attempts not yet used
    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    /// Wait that the next failure would incur
    pub fn current_wait(&self) -> Duration {
        self.current_wait
    }

    /// Mark the operation satisfied; no further attempts
    pub fn on_success(&mut self) {
        self.attempts_left = 0;
    }

    /// Restore the initial attempt count and wait
    pub fn reset(&mut self) {
        self.attempts_left = self.config.max_attempts;
        self.current_wait = self.config.base_wait;
    }

    /// Account for a failure without waiting.
    ///
    /// Returns the wait to apply before the next attempt and advances the
    /// backoff to `2 * wait + jitter`, or fails with
    /// [`RetryError::Exhausted`] when this was the last attempt.
    pub fn record_failure(&mut self) -> Result<Duration, RetryError> {
        self.attempts_left = self.attempts_left.saturating_sub(1);
        if self.attempts_left == 0 {
            return Err(RetryError::Exhausted {
                attempts: self.config.max_attempts,
                last_wait: self.current_wait,
            });
        }

        let wait = self.current_wait;
        self.current_wait = wait * 2 + self.jitter();
        Ok(wait)
    }

    /// Account for a failure and wait before the next attempt.
    ///
    /// The wait ends early with [`RetryError::Cancelled`] if `cancel` fires.
    pub async fn on_failure(&mut self, cancel: &CancellationToken) -> Result<(), RetryError> {
        let wait = self.record_failure()?;
        debug!(
            "Backing off for {:?} ({} attempts left)",
            wait, self.attempts_left
        );

        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = cancel.cancelled() => Err(RetryError::Cancelled),
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }
}
