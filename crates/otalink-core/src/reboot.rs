//! # Reboot Wait State Machine
//!
//! Tracks one post-update reboot from "update accepted" to "device ready".
//!
//! ## Phases (monotonic)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Inactive ──arm()──► AwaitingReconnect ──reconnected──► AwaitingReady  │
//! │                            │                               Marker       │
//! │                            │ reconnect deadline              │          │
//! │                            │                    marker line  │ fallback │
//! │                            ▼                                 ▼          │
//! │                          Done ◄──────────────────────────────┘          │
//! │                                                                         │
//! │  • No transition ever goes backwards                                    │
//! │  • Whichever trigger reaches Done first wins; the others are ignored   │
//! │  • "ready" is reported exactly once                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timers are owned by the async layer; this type only decides what each
//! deadline or line means in the current phase.

use serde::{Deserialize, Serialize};

use crate::latch::OneShot;
use crate::lines::matches_marker;

/// Default readiness marker printed by the device at the end of setup.
pub const DEFAULT_READY_MARKER: &str = "=== Setup complete ===";

/// Phase of a reboot wait.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RebootPhase {
    /// Not armed.
    #[default]
    Inactive,
    /// Waiting for the socket to come back.
    AwaitingReconnect,
    /// Socket is back; waiting for the readiness marker.
    AwaitingReadyMarker,
    /// Ready was reported.
    Done,
}

impl std::fmt::Display for RebootPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebootPhase::Inactive => write!(f, "inactive"),
            RebootPhase::AwaitingReconnect => write!(f, "awaiting_reconnect"),
            RebootPhase::AwaitingReadyMarker => write!(f, "awaiting_ready_marker"),
            RebootPhase::Done => write!(f, "done"),
        }
    }
}

/// What ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyCause {
    /// The device printed the readiness marker.
    Marker,
    /// Reconnected, but the marker did not show up in time.
    Fallback,
    /// The device never came back within the reconnect deadline.
    ReconnectDeadline,
}

/// One reboot wait, from arm to ready.
#[derive(Debug, Clone)]
pub struct RebootWait {
    phase: RebootPhase,
    marker: String,
    ready: OneShot<ReadyCause>,
}

impl RebootWait {
    /// Creates an inactive wait that will look for `marker`.
    pub fn new(marker: impl Into<String>) -> Self {
        RebootWait {
            phase: RebootPhase::Inactive,
            marker: marker.into(),
            ready: OneShot::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RebootPhase {
        self.phase
    }

    /// Marker this wait looks for.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Returns true between arm and ready.
    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            RebootPhase::AwaitingReconnect | RebootPhase::AwaitingReadyMarker
        )
    }

    /// Cause of readiness, once reported.
    pub fn ready_cause(&self) -> Option<ReadyCause> {
        self.ready.get().copied()
    }

    /// Starts waiting for the reconnect. Returns false if already armed.
    pub fn arm(&mut self) -> bool {
        if self.phase != RebootPhase::Inactive {
            return false;
        }
        self.advance(RebootPhase::AwaitingReconnect)
    }

    /// Records the first reconnect after arming.
    ///
    /// Returns true when this call entered `AwaitingReadyMarker`, i.e. when
    /// the fallback timer has to start.
    pub fn on_reconnected(&mut self) -> bool {
        if self.phase != RebootPhase::AwaitingReconnect {
            return false;
        }
        self.advance(RebootPhase::AwaitingReadyMarker)
    }

    /// Inspects one log line for the readiness marker.
    pub fn on_line(&mut self, line: &str) -> Option<ReadyCause> {
        if self.phase != RebootPhase::AwaitingReadyMarker || !matches_marker(line, &self.marker) {
            return None;
        }
        self.finish(ReadyCause::Marker)
    }

    /// The marker fallback timer fired.
    pub fn on_fallback_elapsed(&mut self) -> Option<ReadyCause> {
        if self.phase != RebootPhase::AwaitingReadyMarker {
            return None;
        }
        self.finish(ReadyCause::Fallback)
    }

    /// The reconnect deadline passed without the device coming back.
    pub fn on_reconnect_deadline(&mut self) -> Option<ReadyCause> {
        if self.phase != RebootPhase::AwaitingReconnect {
            return None;
        }
        self.finish(ReadyCause::ReconnectDeadline)
    }

    fn finish(&mut self, cause: ReadyCause) -> Option<ReadyCause> {
        if !self.ready.fire(cause) {
            return None;
        }
        self.advance(RebootPhase::Done);
        Some(cause)
    }

    fn advance(&mut self, to: RebootPhase) -> bool {
        if to <= self.phase {
            return false;
        }
        self.phase = to;
        true
    }
}
