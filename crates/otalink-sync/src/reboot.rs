//! # Reboot Watcher
//!
//! Carries the link through the reboot that follows a successful update.
//!
//! ## Timeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  arm ──quiet (10s)──► reconnect ─2s─► reconnect ─2s─► ...  (retries)   │
//! │   │                                      │                              │
//! │   │                               socket opens                          │
//! │   │                                      │                              │
//! │   │                                      ▼                              │
//! │   │                        AwaitingReadyMarker ──marker──► Ready        │
//! │   │                                      │                              │
//! │   │                                      └──fallback (8s)─► Ready       │
//! │   │                                                                     │
//! │   └────────────reconnect deadline (60s)─────────────────────► Ready     │
//! │                (only while still waiting for the reconnect)             │
//! │                                                                         │
//! │  Ready is reported at most once per arm. A drop while waiting for the  │
//! │  marker resumes the retries at the fixed interval.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Phase decisions live in [`otalink_core::RebootWait`]; this type owns the
//! timers and tells the manager when to dial.

use std::time::Duration;

use tracing::{debug, info};

use otalink_core::reboot::DEFAULT_READY_MARKER;
use otalink_core::{ReadyCause, RebootPhase, RebootWait};

use crate::timer::{self, Timer};

/// Durations of the reboot handshake.
#[derive(Debug, Clone)]
pub struct RebootTimings {
    pub ready_marker: String,
    pub quiet_delay: Duration,
    pub reconnect_interval: Duration,
    pub fallback: Duration,
    pub reconnect_deadline: Duration,
}

impl Default for RebootTimings {
    fn default() -> Self {
        RebootTimings {
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            quiet_delay: Duration::from_millis(10_000),
            reconnect_interval: Duration::from_millis(2_000),
            fallback: Duration::from_millis(8_000),
            reconnect_deadline: Duration::from_millis(60_000),
        }
    }
}

/// What the watcher asks of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherEvent {
    /// Try to reconnect now.
    ReconnectDue,
    /// The device is ready.
    Ready(ReadyCause),
}

enum Wake {
    Retry,
    Fallback,
    Deadline,
}

/// Timer-owning wrapper around one [`RebootWait`].
pub struct RebootWatcher {
    timings: RebootTimings,
    wait: RebootWait,
    retry: Timer,
    fallback: Timer,
    deadline: Timer,
}

impl RebootWatcher {
    pub fn new(timings: RebootTimings) -> Self {
        let wait = RebootWait::new(timings.ready_marker.clone());
        RebootWatcher {
            timings,
            wait,
            retry: None,
            fallback: None,
            deadline: None,
        }
    }

    pub fn phase(&self) -> RebootPhase {
        self.wait.phase()
    }

    /// Returns true between arm and ready.
    pub fn is_active(&self) -> bool {
        self.wait.is_active()
    }

    /// Starts a reboot wait. Returns false if one is already running.
    pub fn arm(&mut self) -> bool {
        if self.wait.is_active() {
            return false;
        }

        self.wait = RebootWait::new(self.timings.ready_marker.clone());
        self.wait.arm();
        self.retry = timer::start(self.timings.quiet_delay);
        self.deadline = timer::start(self.timings.reconnect_deadline);
        self.fallback = None;

        info!(
            quiet_delay = ?self.timings.quiet_delay,
            deadline = ?self.timings.reconnect_deadline,
            "Waiting for the device to reboot"
        );
        true
    }

    /// The socket opened.
    pub fn on_connected(&mut self) {
        if !self.wait.is_active() {
            return;
        }

        self.retry = None;
        if self.wait.on_reconnected() {
            info!(fallback = ?self.timings.fallback, "Device reconnected, waiting for the ready marker");
            self.deadline = None;
            self.fallback = timer::start(self.timings.fallback);
        }
    }

    /// The socket closed or a connection attempt failed.
    pub fn on_disconnected(&mut self) {
        if self.wait.phase() == RebootPhase::AwaitingReadyMarker && self.retry.is_none() {
            debug!("Lost the device while waiting for the marker, retrying");
            self.retry = timer::start(self.timings.reconnect_interval);
        }
    }

    /// Inspects one log line.
    pub fn on_line(&mut self, line: &str) -> Option<ReadyCause> {
        let cause = self.wait.on_line(line)?;
        self.finish(cause);
        Some(cause)
    }

    /// Waits for the next watcher event. Cancel-safe.
    pub async fn next_event(&mut self) -> WatcherEvent {
        loop {
            let wake = tokio::select! {
                _ = timer::fired(&mut self.retry) => Wake::Retry,
                _ = timer::fired(&mut self.fallback) => Wake::Fallback,
                _ = timer::fired(&mut self.deadline) => Wake::Deadline,
            };

            let event = match wake {
                Wake::Retry => {
                    self.retry = timer::start(self.timings.reconnect_interval);
                    Some(WatcherEvent::ReconnectDue)
                }
                Wake::Fallback => {
                    self.fallback = None;
                    self.wait.on_fallback_elapsed().map(WatcherEvent::Ready)
                }
                Wake::Deadline => {
                    self.deadline = None;
                    self.wait.on_reconnect_deadline().map(WatcherEvent::Ready)
                }
            };

            if let Some(event) = event {
                if let WatcherEvent::Ready(cause) = event {
                    self.finish(cause);
                }
                return event;
            }
        }
    }

    fn finish(&mut self, cause: ReadyCause) {
        info!(?cause, "Device ready");
        self.retry = None;
        self.fallback = None;
        self.deadline = None;
    }
}
