//! Push channel state machine.
//!
//! One channel per subscription topic (`bookings/{tenant}`,
//! `analytics/{tenant}`). Manages the connect attempt, the connection timeout,
//! exponential reconnect backoff and the fallback-to-polling flag. Uses the
//! action pattern: methods take time as input and return actions for the
//! driver to execute. The driver owns the actual SSE transport and tags every
//! transport event with the attempt number it was started with, so events from
//! an abandoned transport are recognised and ignored.
//!
//! # State Machine
//!
//! ```text
//!                  open               opened
//! ┌──────────────┐ ───> ┌────────────┐ ───> ┌───────────┐
//! │ Disconnected │      │ Connecting │      │ Connected │
//! └──────────────┘ <─── └────────────┘      └───────────┘
//!        │       timeout   ↑      │               │
//!        │         backoff │      │ error         │ error
//!        └─────────────────┤      ↓               │
//!                          │ ┌──────────────┐     │
//!                          └─│ Reconnecting │ <───┘
//!                            └──────────────┘
//! ```
//!
//! # Connection timeout
//!
//! The timeout bounds how long the channel may go without a live stream. It
//! is armed by [`Channel::open`] and when a connected stream fails, and it
//! keeps running across failed attempts, so a server that rejects every
//! request still sends the channel into fallback polling. When it fires
//! during an attempt, the attempt is closed, the channel reports
//! `Disconnected` and a reconnect is scheduled with the usual backoff. When
//! it fires while a reconnect is already scheduled, only fallback polling is
//! switched on. Once in fallback, every new attempt gets a timeout of its own
//! so a hung request is abandoned.
//!
//! [`Channel::close`] is terminal: no state, no timers, no actions afterwards.

use std::{
    ops::{Add, Sub},
    time::{Duration, Instant},
};

use tracing::{debug, info};

use crate::{Subscription, error::ChannelError};

/// Time allowed for the push stream to open before falling back to polling.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before the first reconnect. Doubles with every consecutive failure.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound of the reconnect delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Refetch interval for subscribed queries while the push stream is down.
pub const DEFAULT_FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not connected. Initial state, after a connection timeout, and after
    /// close.
    Disconnected,
    /// Transport started, waiting for the stream to open
    Connecting,
    /// Stream open, events flowing
    Connected,
    /// Transport failed, waiting for the backoff timer
    Reconnecting,
}

impl ChannelState {
    /// Lowercase name, as shown in status lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable snapshot of a channel.
///
/// This is what views read: whether the stream is live and how often the
/// queries it feeds should be polled instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Connection state
    pub state: ChannelState,
    /// Consecutive failed attempts since the last successful open
    pub retry_count: u32,
    /// True while the stream could not be opened in time
    pub fallback_polling: bool,
    /// Refetch interval for dependent queries, zero while the stream is live
    pub polling_interval: Duration,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Disconnected,
            retry_count: 0,
            fallback_polling: false,
            polling_interval: Duration::ZERO,
        }
    }
}

/// Actions returned by the channel state machine.
///
/// The driver executes these actions:
/// - `Connect`: Start an SSE request for `path`, tagging its events with
///   `attempt`
/// - `CloseTransport`: Abort the transport started for `attempt`
/// - `StatusChanged`: Publish the new status to observers
/// - `Deliver`: Hand the raw payload to the event router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Start a new transport
    Connect {
        /// Attempt number the transport's events must carry
        attempt: u64,
        /// SSE path, relative to the API base URL
        path: String,
    },

    /// Abort a transport
    CloseTransport {
        /// Attempt to abort
        attempt: u64,
    },

    /// Observable status changed
    StatusChanged(ChannelStatus),

    /// Inbound payload, verbatim
    Deliver {
        /// Raw `data` of one SSE message
        raw: String,
    },
}

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Time allowed for the stream to open
    pub connect_timeout: Duration,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Reconnect delay cap
    pub max_retry_delay: Duration,
    /// Polling interval while in fallback mode
    pub fallback_poll_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            fallback_poll_interval: DEFAULT_FALLBACK_POLL_INTERVAL,
        }
    }
}

impl ChannelConfig {
    /// Reconnect delay after `retry_count` earlier consecutive failures:
    /// `min(base * 2^retry_count, max)`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.backoff_base.checked_mul(factor))
            .map_or(self.max_retry_delay, |delay| delay.min(self.max_retry_delay))
    }
}

/// Push channel state machine
///
/// Pure state machine: no I/O, no clock. Time is passed to the methods that
/// need it and [`Channel::next_deadline`] tells the driver when to call
/// [`Channel::tick`] next.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug, Clone)]
pub struct Channel<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration> + Add<Duration, Output = I>,
{
    /// Topic key, e.g. `bookings/tenant-1`
    key: String,
    /// SSE path
    path: String,
    /// Configuration
    config: ChannelConfig,
    /// Current state
    state: ChannelState,
    /// Number of the current (or last) transport attempt. Zero before open.
    attempt: u64,
    /// Consecutive failures since the last successful open
    retry_count: u32,
    /// Fallback polling flag
    fallback: bool,
    /// Time of the most recent failure
    last_error_at: Option<I>,
    /// Time by which a stream must be open
    connect_deadline: Option<I>,
    /// Scheduled reconnect
    reconnect_at: Option<I>,
    /// Set by `close`, terminal
    closed: bool,
}

impl<I> Channel<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration> + Add<Duration, Output = I>,
{
    /// Create a channel for `subscription` in [`ChannelState::Disconnected`]
    /// state.
    pub fn new(subscription: &Subscription, config: ChannelConfig) -> Self {
        Self {
            key: subscription.key(),
            path: subscription.path(),
            config,
            state: ChannelState::Disconnected,
            attempt: 0,
            retry_count: 0,
            fallback: false,
            last_error_at: None,
            connect_deadline: None,
            reconnect_at: None,
            closed: false,
        }
    }

    /// Topic key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Current attempt number. Zero before the first open.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Time of the most recent timeout or transport failure.
    pub fn last_error_at(&self) -> Option<I> {
        self.last_error_at
    }

    /// True while dependent queries should be polled.
    pub fn is_fallback(&self) -> bool {
        self.fallback && !self.closed
    }

    /// True once [`Channel::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Refetch interval for dependent queries: zero while connected via push,
    /// the fallback interval while in fallback mode.
    pub fn polling_interval(&self) -> Duration {
        if self.is_fallback() { self.config.fallback_poll_interval } else { Duration::ZERO }
    }

    /// Observable snapshot.
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            state: self.state,
            retry_count: self.retry_count,
            fallback_polling: self.is_fallback(),
            polling_interval: self.polling_interval(),
        }
    }

    /// Earliest time at which [`Channel::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<I> {
        if self.closed {
            return None;
        }

        match (self.connect_deadline, self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Start the first connect attempt.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Closed` if the channel was closed
    /// - `ChannelError::InvalidState` if the channel was already opened
    pub fn open(&mut self, now: I) -> Result<Vec<ChannelAction>, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed { key: self.key.clone() });
        }

        if self.attempt != 0 {
            return Err(ChannelError::InvalidState {
                state: self.state,
                operation: "open".to_string(),
            });
        }

        info!(channel = %self.key, "opening push channel");
        Ok(self.start_attempt(now))
    }

    /// Transport of `attempt` reported the stream as open.
    ///
    /// Resets the retry count and leaves fallback mode. Ignored for stale
    /// attempts.
    pub fn handle_opened(&mut self, attempt: u64, _now: I) -> Vec<ChannelAction> {
        if !self.is_live(attempt) || self.state != ChannelState::Connecting {
            debug!(channel = %self.key, attempt, "ignoring open of inactive attempt");
            return Vec::new();
        }

        self.state = ChannelState::Connected;
        self.retry_count = 0;
        self.fallback = false;
        self.connect_deadline = None;

        info!(channel = %self.key, attempt, "push channel connected");
        vec![ChannelAction::StatusChanged(self.status())]
    }

    /// Transport of `attempt` delivered one message.
    ///
    /// The payload is forwarded verbatim. Ignored unless the attempt is the
    /// current one and connected.
    pub fn handle_message(&mut self, attempt: u64, raw: String) -> Vec<ChannelAction> {
        if !self.is_live(attempt) || self.state != ChannelState::Connected {
            debug!(channel = %self.key, attempt, "dropping message of inactive attempt");
            return Vec::new();
        }

        vec![ChannelAction::Deliver { raw }]
    }

    /// Transport of `attempt` failed or ended.
    ///
    /// Closes the transport and schedules a reconnect with exponential
    /// backoff. A connected stream arms the connection timeout, a failed
    /// attempt leaves it running. Ignored for stale attempts.
    pub fn handle_error(&mut self, attempt: u64, now: I) -> Vec<ChannelAction> {
        if !self.is_live(attempt) {
            debug!(channel = %self.key, attempt, "ignoring failure of inactive attempt");
            return Vec::new();
        }

        if self.state == ChannelState::Connected {
            self.connect_deadline = Some(now + self.config.connect_timeout);
        }
        self.state = ChannelState::Reconnecting;
        self.last_error_at = Some(now);
        let delay = self.schedule_reconnect(now);

        debug!(channel = %self.key, attempt, ?delay, retry = self.retry_count, "transport failed");
        vec![ChannelAction::CloseTransport { attempt }, ChannelAction::StatusChanged(self.status())]
    }

    /// Fire due timers.
    ///
    /// Call at (or after) [`Channel::next_deadline`]. A connection timeout
    /// takes precedence over a reconnect due at the same time, which then
    /// stays due for the next call.
    pub fn tick(&mut self, now: I) -> Vec<ChannelAction> {
        if self.closed {
            return Vec::new();
        }

        if let Some(deadline) = self.connect_deadline
            && now >= deadline
        {
            self.connect_deadline = None;
            let actions = self.connect_timed_out(now);
            if !actions.is_empty() {
                return actions;
            }
        }

        if let Some(at) = self.reconnect_at
            && now >= at
        {
            debug!(channel = %self.key, retry = self.retry_count, "reconnecting");
            return self.start_attempt(now);
        }

        Vec::new()
    }

    /// Tear the channel down.
    ///
    /// Cancels both timers and closes the live transport, if any. Idempotent:
    /// a second call returns no actions.
    pub fn close(&mut self) -> Vec<ChannelAction> {
        if self.closed {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if matches!(self.state, ChannelState::Connecting | ChannelState::Connected) {
            actions.push(ChannelAction::CloseTransport { attempt: self.attempt });
        }

        let was = self.status();
        self.closed = true;
        self.state = ChannelState::Disconnected;
        self.connect_deadline = None;
        self.reconnect_at = None;

        if self.status() != was {
            actions.push(ChannelAction::StatusChanged(self.status()));
        }

        info!(channel = %self.key, "push channel closed");
        actions
    }

    /// No stream opened within the connection timeout.
    fn connect_timed_out(&mut self, now: I) -> Vec<ChannelAction> {
        match self.state {
            ChannelState::Connecting => {
                let attempt = self.attempt;
                self.state = ChannelState::Disconnected;
                self.fallback = true;
                self.last_error_at = Some(now);
                let delay = self.schedule_reconnect(now);

                info!(
                    channel = %self.key,
                    attempt,
                    ?delay,
                    "connect timeout, falling back to polling"
                );
                vec![
                    ChannelAction::CloseTransport { attempt },
                    ChannelAction::StatusChanged(self.status()),
                ]
            },
            ChannelState::Reconnecting if !self.fallback => {
                self.fallback = true;

                info!(
                    channel = %self.key,
                    retry = self.retry_count,
                    "no stream within connect timeout, falling back to polling"
                );
                vec![ChannelAction::StatusChanged(self.status())]
            },
            ChannelState::Reconnecting | ChannelState::Disconnected | ChannelState::Connected => {
                Vec::new()
            },
        }
    }

    /// True if events tagged with `attempt` come from the live transport.
    fn is_live(&self, attempt: u64) -> bool {
        !self.closed
            && attempt == self.attempt
            && matches!(self.state, ChannelState::Connecting | ChannelState::Connected)
    }

    fn start_attempt(&mut self, now: I) -> Vec<ChannelAction> {
        self.attempt += 1;
        self.state = ChannelState::Connecting;
        self.connect_deadline.get_or_insert(now + self.config.connect_timeout);
        self.reconnect_at = None;

        vec![
            ChannelAction::Connect { attempt: self.attempt, path: self.path.clone() },
            ChannelAction::StatusChanged(self.status()),
        ]
    }

    fn schedule_reconnect(&mut self, now: I) -> Duration {
        let delay = self.config.retry_delay(self.retry_count);
        self.retry_count = self.retry_count.saturating_add(1);
        self.reconnect_at = Some(now + delay);
        delay
    }
}
