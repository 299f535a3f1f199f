//! # Link Types
//!
//! Shared value types for the device link: connection states, close-code
//! classification, link quality, upload targets and the public event stream.
//!
//! ## Event Stream
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     LinkEvent (one ordered stream)                      │
//! │                                                                         │
//! │  connected              socket open (normal or post-reboot)            │
//! │  disconnected           socket gone; reconnect_in_ms when scheduled     │
//! │  log_line               one device log line, already split             │
//! │  upload_progress        percent of the active attempt                  │
//! │  upload_resolved        exactly once per attempt                       │
//! │  device_ready           exactly once per successful update             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::outcome::UploadOutcome;
use crate::reboot::ReadyCause;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the streaming socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Socket open in progress.
    Connecting,
    /// Connected and delivering lines.
    Open,
    /// Close requested, waiting for the socket to finish.
    Closing,
    /// Socket gone.
    Closed,
}

impl ConnectionState {
    /// Returns true while a connection exists or is being established.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// Close Codes
// =============================================================================

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Returns true for close codes that mean "expected, do not reconnect".
///
/// Only 1000 and 1001 count as clean; a missing code (connection dropped
/// without a close frame) is abnormal.
pub fn is_clean_close(code: Option<u16>) -> bool {
    matches!(code, Some(CLOSE_NORMAL) | Some(CLOSE_GOING_AWAY))
}

// =============================================================================
// Link Quality
// =============================================================================

/// Default RSSI threshold below which the Wi-Fi link counts as weak.
pub const DEFAULT_WEAK_RSSI_DBM: i32 = -70;

/// Last known Wi-Fi quality of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkQuality {
    /// Last RSSI reading in dBm, if any was ever reported.
    pub rssi_dbm: Option<i32>,
}

impl LinkQuality {
    /// Creates a quality reading from an RSSI value.
    pub fn from_rssi(rssi_dbm: i32) -> Self {
        LinkQuality {
            rssi_dbm: Some(rssi_dbm),
        }
    }

    /// Returns true when the last reading is strictly below `threshold_dbm`.
    ///
    /// An unknown reading is never weak.
    pub fn is_weak(&self, threshold_dbm: i32) -> bool {
        self.rssi_dbm.is_some_and(|rssi| rssi < threshold_dbm)
    }
}

// =============================================================================
// Upload Target
// =============================================================================

/// Which image an upload carries. Each target has its own endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTarget {
    /// Application firmware image.
    Firmware,
    /// Filesystem (web frontend) image.
    Filesystem,
}

impl fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadTarget::Firmware => write!(f, "firmware"),
            UploadTarget::Filesystem => write!(f, "filesystem"),
        }
    }
}

impl FromStr for UploadTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "firmware" | "fw" => Ok(UploadTarget::Firmware),
            "filesystem" | "fs" | "frontend" | "littlefs" => Ok(UploadTarget::Filesystem),
            other => Err(format!(
                "Unknown upload target: '{}'. Valid options: firmware, filesystem",
                other
            )),
        }
    }
}

/// Identifier of one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadAttemptId(Uuid);

impl UploadAttemptId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        UploadAttemptId(Uuid::new_v4())
    }
}

impl Default for UploadAttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Link Events
// =============================================================================

/// Everything presentation needs to know, in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkEvent {
    /// The socket is open.
    Connected,

    /// The socket closed. `reconnect_in_ms` is set when a normal reconnect
    /// has been scheduled.
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_in_ms: Option<u64>,
    },

    /// One device log line.
    LogLine {
        line: String,
        received_at: DateTime<Utc>,
    },

    /// Upload progress, emitted when the whole percent changes.
    UploadProgress {
        attempt: UploadAttemptId,
        target: UploadTarget,
        percent: u8,
    },

    /// Terminal outcome of an upload attempt.
    UploadResolved {
        attempt: UploadAttemptId,
        target: UploadTarget,
        outcome: UploadOutcome,
    },

    /// The device is back after an update.
    DeviceReady { cause: ReadyCause },
}

impl LinkEvent {
    /// Builds a `Disconnected` event from an optional reconnect delay.
    pub fn disconnected(reconnect_in: Option<Duration>) -> Self {
        LinkEvent::Disconnected {
            reconnect_in_ms: reconnect_in.map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64),
        }
    }

    /// Returns a short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            LinkEvent::Connected => "connected",
            LinkEvent::Disconnected { .. } => "disconnected",
            LinkEvent::LogLine { .. } => "log_line",
            LinkEvent::UploadProgress { .. } => "upload_progress",
            LinkEvent::UploadResolved { .. } => "upload_resolved",
            LinkEvent::DeviceReady { .. } => "device_ready",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_close_codes() {
        assert!(is_clean_close(Some(1000)));
        assert!(is_clean_close(Some(1001)));
        assert!(!is_clean_close(Some(1006)));
        assert!(!is_clean_close(Some(4000)));
        assert!(!is_clean_close(None));
    }

    #[test]
    fn test_link_quality_threshold() {
        assert!(!LinkQuality::default().is_weak(DEFAULT_WEAK_RSSI_DBM));
        assert!(!LinkQuality::from_rssi(-70).is_weak(DEFAULT_WEAK_RSSI_DBM));
        assert!(LinkQuality::from_rssi(-71).is_weak(DEFAULT_WEAK_RSSI_DBM));
        assert!(!LinkQuality::from_rssi(-55).is_weak(DEFAULT_WEAK_RSSI_DBM));
    }

    #[test]
    fn test_upload_target_parsing() {
        assert_eq!("firmware".parse::<UploadTarget>().unwrap(), UploadTarget::Firmware);
        assert_eq!("FS".parse::<UploadTarget>().unwrap(), UploadTarget::Filesystem);
        assert_eq!("littlefs".parse::<UploadTarget>().unwrap(), UploadTarget::Filesystem);
        assert!("bootloader".parse::<UploadTarget>().is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(LinkEvent::disconnected(Some(Duration::from_secs(4)))).unwrap();
        assert_eq!(json["type"], "disconnected");
        assert_eq!(json["reconnect_in_ms"], 4000);

        let json = serde_json::to_value(LinkEvent::disconnected(None)).unwrap();
        assert!(json.get("reconnect_in_ms").is_none());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert!(ConnectionState::Connecting.is_live());
        assert!(!ConnectionState::Closing.is_live());
    }
}
