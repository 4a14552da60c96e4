//! Reconnection scheduling.
//!
//! [`ReconnectPolicy`] owns at most one pending reconnection timer. Scheduling a new attempt
//! replaces the pending one, and [`ReconnectPolicy::cancel`] aborts it before returning.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::task::AbortHandle;
use tokio::time::sleep;

use super::config::{ReconnectConfig, exponential_backoff};

/// Decides when to re-establish a dropped connection and runs the timer that does it.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    /// Backoff schedule, only present for [`ReconnectConfig::Exponential`]
    backoff: Mutex<Option<ExponentialBackoff>>,
    /// The single pending timer, if any
    pending: Mutex<Option<AbortHandle>>,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        let backoff = match &config {
            ReconnectConfig::Exponential {
                initial_backoff,
                max_backoff,
                backoff_multiplier,
                ..
            } => Some(exponential_backoff(
                *initial_backoff,
                *max_backoff,
                *backoff_multiplier,
            )),
            ReconnectConfig::Fixed { .. } => None,
        };

        Self {
            config,
            backoff: Mutex::new(backoff),
            pending: Mutex::new(None),
        }
    }

    /// Delay before reconnection attempt number `attempt` (1-based), or `None` once the
    /// configured attempt budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts()
            && attempt > max
        {
            return None;
        }

        match &self.config {
            ReconnectConfig::Fixed { delay } => Some(*delay),
            ReconnectConfig::Exponential { initial_backoff, .. } => self
                .backoff
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_mut()
                .and_then(|backoff| backoff.next_backoff())
                .or(Some(*initial_backoff)),
        }
    }

    /// Arm the reconnection timer for `attempt`. When it fires, `connect` is invoked.
    ///
    /// Any timer that is still pending is aborted first, so at most one attempt is ever armed.
    /// Returns the delay that was scheduled, or `None` if the policy has given up.
    pub fn schedule<F>(&self, attempt: u32, connect: F) -> Option<Duration>
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.next_delay(attempt)?;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            connect();
        });
        *pending = Some(handle.abort_handle());

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, ?delay, "Scheduled reconnection attempt");

        Some(delay)
    }

    /// Abort the pending timer, if any. Returns whether a timer was still waiting.
    pub fn cancel(&self) -> bool {
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match previous {
            Some(handle) => {
                let was_waiting = !handle.is_finished();
                handle.abort();
                was_waiting
            }
            None => false,
        }
    }

    /// Forget past failures after a successful reconnect and release the timer.
    pub fn reset(&self) {
        drop(
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        if let Some(backoff) = self
            .backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            backoff.reset();
        }
    }

    /// Whether a reconnection timer is armed and has not fired yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
