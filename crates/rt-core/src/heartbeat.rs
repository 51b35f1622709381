//! Liveness Heartbeat
//!
//! Every session carries a `heart` data channel. Once it opens, the session is
//! usable and a counter is sent over it on a fixed interval. Too many
//! consecutive failures, or the channel closing, end the session.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::peer::{ChannelEvent, DataChannel};

/// Default time between two heartbeat messages
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(3000);

/// Shortest period the ticker will run at
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Default number of consecutive errors tolerated
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// Heartbeat timing and tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,

    /// The session closes once consecutive errors exceed this value
    pub error_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
        }
    }
}

impl HeartbeatConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }
}

/// Counters of one heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    tick: u64,
    consecutive_errors: u32,
    threshold: u32,
}

impl HeartbeatState {
    pub fn new(threshold: u32) -> Self {
        Self {
            tick: 0,
            consecutive_errors: 0,
            threshold,
        }
    }

    /// Next counter value to send, starting at 1
    pub fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Count an error; returns true once the threshold is exceeded
    pub fn record_error(&mut self) -> bool {
        self.consecutive_errors += 1;
        self.consecutive_errors > self.threshold
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

/// Why a heartbeat stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The owning session was closed
    Cancelled,
    /// The liveness channel closed or was never available
    ChannelClosed,
    /// Consecutive errors exceeded the threshold
    TooManyErrors(u32),
}

impl std::fmt::Display for HeartbeatExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatExit::Cancelled => write!(f, "heartbeat cancelled"),
            HeartbeatExit::ChannelClosed => write!(f, "heartbeat channel closed"),
            HeartbeatExit::TooManyErrors(n) => write!(f, "{} consecutive heartbeat errors", n),
        }
    }
}

/// Drives the liveness channel of one session
pub struct HeartbeatMonitor {
    channel: Arc<dyn DataChannel>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
    state: HeartbeatState,
}

impl HeartbeatMonitor {
    pub fn new(channel: Arc<dyn DataChannel>, config: HeartbeatConfig, cancel: CancellationToken) -> Self {
        Self {
            channel,
            config,
            cancel,
            state: HeartbeatState::new(config.error_threshold),
        }
    }

    /// Run until cancelled or the session must close.
    ///
    /// `on_usable` is invoked once, when the channel first opens.
    pub async fn run<F>(mut self, on_usable: F) -> HeartbeatExit
    where
        F: FnOnce() + Send,
    {
        let Some(mut events) = self.channel.take_events() else {
            return HeartbeatExit::ChannelClosed;
        };

        // Wait for the channel to open
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return HeartbeatExit::Cancelled,
                event = events.recv() => match event {
                    Some(ChannelEvent::Open) => break,
                    Some(ChannelEvent::Message(_)) => {}
                    Some(ChannelEvent::Error(e)) => {
                        if let Some(exit) = self.on_error(&e) {
                            return exit;
                        }
                    }
                    Some(ChannelEvent::Close) | None => return HeartbeatExit::ChannelClosed,
                }
            }
        }

        on_usable();

        // interval_at panics on a zero period
        let period = self.config.interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return HeartbeatExit::Cancelled,
                _ = ticker.tick() => {
                    let tick = self.state.next_tick();
                    match self.channel.send_text(&tick.to_string()).await {
                        Ok(()) => self.state.record_success(),
                        Err(e) => {
                            if let Some(exit) = self.on_error(&e.to_string()) {
                                return exit;
                            }
                        }
                    }
                }
                event = events.recv() => match event {
                    // The remote counter carries no information
                    Some(ChannelEvent::Message(_)) | Some(ChannelEvent::Open) => {}
                    Some(ChannelEvent::Error(e)) => {
                        if let Some(exit) = self.on_error(&e) {
                            return exit;
                        }
                    }
                    Some(ChannelEvent::Close) | None => {
                        debug!("Heartbeat channel closed");
                        return HeartbeatExit::ChannelClosed;
                    }
                }
            }
        }
    }

    fn on_error(&mut self, reason: &str) -> Option<HeartbeatExit> {
        let fatal = self.state.record_error();
        warn!(
            "Heartbeat error ({} consecutive): {}",
            self.state.consecutive_errors(),
            reason
        );
        fatal.then(|| HeartbeatExit::TooManyErrors(self.state.consecutive_errors()))
    }
}
