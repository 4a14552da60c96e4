#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_DELAY_DURATION: Duration = Duration::from_secs(3);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for WebSocket client behavior.
///
/// The heartbeat is off by default; enable it with [`Config::with_heartbeat`] against servers
/// that answer `ping` with `pong`.
///
/// ```
/// use std::time::Duration;
///
/// use team_chat_transport::ws::config::{Config, ReconnectConfig};
///
/// let config = Config::default()
///     .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(500)))
///     .with_heartbeat(Duration::from_secs(30), Duration::from_secs(10));
/// assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(30)));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval for sending `ping` frames to keep the connection alive.
    /// `None`, the default, disables the heartbeat entirely.
    pub heartbeat_interval: Option<Duration>,
    /// Maximum time to wait for a `pong` frame before considering the connection dead
    pub heartbeat_timeout: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Replace the reconnection strategy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Send a `ping` every `interval` and expect a `pong` within `timeout`.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self.heartbeat_timeout = timeout;
        self
    }

    /// Disable the heartbeat.
    #[must_use]
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The default retries forever after a fixed three second delay. [`ReconnectConfig::Exponential`]
/// spreads reconnects out with jittered exponential backoff and an optional attempt cap.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectConfig {
    /// Retry after the same delay every time, without limit.
    Fixed {
        /// Delay between an involuntary close and the next attempt
        delay: Duration,
    },
    /// Retry with jittered exponential backoff.
    Exponential {
        /// Maximum number of reconnection attempts before giving up.
        /// `None` means infinite retries.
        max_attempts: Option<u32>,
        /// Initial backoff duration for first reconnection attempt
        initial_backoff: Duration,
        /// Maximum backoff duration
        max_backoff: Duration,
        /// Multiplier for exponential backoff
        backoff_multiplier: f64,
    },
}

impl ReconnectConfig {
    /// Fixed-delay reconnection with unlimited attempts.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Exponential backoff starting at `initial_backoff` and capped at `max_backoff`.
    #[must_use]
    pub const fn exponential(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self::Exponential {
            max_attempts: None,
            initial_backoff,
            max_backoff,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Cap the number of attempts. Has no effect on [`ReconnectConfig::Fixed`].
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        if let Self::Exponential { max_attempts, .. } = &mut self {
            *max_attempts = Some(attempts);
        }
        self
    }

    /// Maximum number of attempts, if bounded.
    #[must_use]
    pub const fn max_attempts(&self) -> Option<u32> {
        match self {
            Self::Fixed { .. } => None,
            Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::Fixed {
            delay: DEFAULT_RECONNECT_DELAY_DURATION,
        }
    }
}

/// Build the backoff schedule for an exponential configuration.
pub(crate) fn exponential_backoff(
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
) -> ExponentialBackoff {
    ExponentialBackoffBuilder::default()
        .with_initial_interval(initial_backoff)
        .with_max_interval(max_backoff)
        .with_multiplier(backoff_multiplier)
        .with_max_elapsed_time(None) // We handle max attempts separately
        .build()
}
