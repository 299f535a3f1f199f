//! # Link Configuration
//!
//! Configuration management for the device link.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     OTALINK_HOST=192.168.4.1                                           │
//! │     OTALINK_FALLBACK_MS=8000                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/otalink/link.toml (Linux)                                │
//! │     ~/Library/Application Support/dev.otalink.otalink/link.toml (macOS)│
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # link.toml
//! [device]
//! host = "192.168.4.1"
//! use_tls = false
//! username = "admin"
//! password = "admin"
//!
//! [transport]
//! reconnect_base_ms = 2000
//! reconnect_max_ms = 30000
//!
//! [upload]
//! grace_ms = 500
//! near_complete_percent = 98
//!
//! [reboot]
//! ready_marker = "=== Setup complete ==="
//! fallback_ms = 8000
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use otalink_core::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_WEAK_SIGNAL_FACTOR};
use otalink_core::outcome::{DEFAULT_GRACE_MS, DEFAULT_NEAR_COMPLETE_PERCENT};
use otalink_core::reboot::DEFAULT_READY_MARKER;
use otalink_core::{BackoffPolicy, ResolverSettings, UploadTarget, DEFAULT_WEAK_RSSI_DBM};

use crate::error::{LinkError, LinkResult};
use crate::reboot::RebootTimings;
use crate::transport::SessionSettings;
use crate::upload::MonitorSettings;

// =============================================================================
// Device Settings
// =============================================================================

/// HTTP basic credentials for the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Where the device lives and how to authenticate to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Host name or address, optionally with a port (`host:port`).
    #[serde(default = "default_host")]
    pub host: String,

    /// Use `wss://` and `https://` instead of plain schemes.
    #[serde(default)]
    pub use_tls: bool,

    /// Basic-auth user name for uploads.
    #[serde(default)]
    pub username: Option<String>,

    /// Basic-auth password for uploads.
    #[serde(default)]
    pub password: Option<String>,
}

fn default_host() -> String {
    "192.168.4.1".to_string()
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            host: default_host(),
            use_tls: false,
            username: None,
            password: None,
        }
    }
}

// =============================================================================
// Transport Settings
// =============================================================================

/// Streaming socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// WebSocket path on the device.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Connection timeout (milliseconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Time allowed for a requested close to finish (milliseconds).
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Keepalive ping interval (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// First reconnect delay (milliseconds).
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay cap (milliseconds).
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Multiplier applied to the delay on a weak signal.
    #[serde(default = "default_weak_signal_factor")]
    pub weak_signal_factor: f64,

    /// RSSI below which the signal counts as weak (dBm).
    #[serde(default = "default_weak_rssi")]
    pub weak_rssi_dbm: i32,
}

fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_connect_timeout() -> u64 {
    5_000
}
fn default_close_timeout() -> u64 {
    2_000
}
fn default_ping_interval() -> u64 {
    30
}
fn default_reconnect_base() -> u64 {
    DEFAULT_BASE_DELAY.as_millis() as u64
}
fn default_reconnect_max() -> u64 {
    DEFAULT_MAX_DELAY.as_millis() as u64
}
fn default_weak_signal_factor() -> f64 {
    DEFAULT_WEAK_SIGNAL_FACTOR
}
fn default_weak_rssi() -> i32 {
    DEFAULT_WEAK_RSSI_DBM
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            ws_path: default_ws_path(),
            connect_timeout_ms: default_connect_timeout(),
            close_timeout_ms: default_close_timeout(),
            ping_interval_secs: default_ping_interval(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_ms: default_reconnect_max(),
            weak_signal_factor: default_weak_signal_factor(),
            weak_rssi_dbm: default_weak_rssi(),
        }
    }
}

// =============================================================================
// Upload Settings
// =============================================================================

/// Image upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Endpoint for firmware images.
    #[serde(default = "default_firmware_path")]
    pub firmware_path: String,

    /// Endpoint for filesystem images.
    #[serde(default = "default_filesystem_path")]
    pub filesystem_path: String,

    /// Multipart field carrying the image.
    #[serde(default = "default_field_name")]
    pub field_name: String,

    /// Quiet period after 100% before success is assumed (milliseconds).
    #[serde(default = "default_grace")]
    pub grace_ms: u64,

    /// Progress at which a network error still counts as success.
    #[serde(default = "default_near_complete")]
    pub near_complete_percent: u8,

    /// Whole-request timeout (seconds).
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,
}

fn default_firmware_path() -> String {
    "/update".to_string()
}
fn default_filesystem_path() -> String {
    "/update-fs".to_string()
}
fn default_field_name() -> String {
    "update".to_string()
}
fn default_grace() -> u64 {
    DEFAULT_GRACE_MS
}
fn default_near_complete() -> u8 {
    DEFAULT_NEAR_COMPLETE_PERCENT
}
fn default_upload_timeout() -> u64 {
    300
}

impl Default for UploadSettings {
    fn default() -> Self {
        UploadSettings {
            firmware_path: default_firmware_path(),
            filesystem_path: default_filesystem_path(),
            field_name: default_field_name(),
            grace_ms: default_grace(),
            near_complete_percent: default_near_complete(),
            timeout_secs: default_upload_timeout(),
        }
    }
}

// =============================================================================
// Reboot Settings
// =============================================================================

/// Post-update reboot handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootSettings {
    /// Log line that means the device finished booting.
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,

    /// Wait before the first reconnect attempt (milliseconds).
    #[serde(default = "default_quiet_delay")]
    pub quiet_delay_ms: u64,

    /// Interval between reconnect attempts (milliseconds).
    #[serde(default = "default_reboot_interval")]
    pub reconnect_interval_ms: u64,

    /// How long to wait for the marker after reconnecting (milliseconds).
    #[serde(default = "default_fallback")]
    pub fallback_ms: u64,

    /// Give up waiting for the reconnect after this long (milliseconds).
    /// Defaults to 60000, measured from the moment the reboot wait is armed.
    #[serde(default = "default_reconnect_deadline")]
    pub reconnect_deadline_ms: u64,
}

fn default_ready_marker() -> String {
    DEFAULT_READY_MARKER.to_string()
}
fn default_quiet_delay() -> u64 {
    10_000
}
fn default_reboot_interval() -> u64 {
    2_000
}
fn default_fallback() -> u64 {
    8_000
}
fn default_reconnect_deadline() -> u64 {
    60_000
}

impl Default for RebootSettings {
    fn default() -> Self {
        RebootSettings {
            ready_marker: default_ready_marker(),
            quiet_delay_ms: default_quiet_delay(),
            reconnect_interval_ms: default_reboot_interval(),
            fallback_ms: default_fallback(),
            reconnect_deadline_ms: default_reconnect_deadline(),
        }
    }
}

// =============================================================================
// Status Settings
// =============================================================================

/// Status polling (RSSI only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    /// Poll the status endpoint at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Status endpoint path.
    #[serde(default = "default_status_path")]
    pub path: String,

    /// Poll interval (seconds).
    #[serde(default = "default_status_interval")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_status_path() -> String {
    "/api/status".to_string()
}
fn default_status_interval() -> u64 {
    10
}

impl Default for StatusSettings {
    fn default() -> Self {
        StatusSettings {
            enabled: true,
            path: default_status_path(),
            interval_secs: default_status_interval(),
        }
    }
}

// =============================================================================
// Main Link Configuration
// =============================================================================

/// Complete link configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub upload: UploadSettings,

    #[serde(default)]
    pub reboot: RebootSettings,

    #[serde(default)]
    pub status: StatusSettings,
}

impl LinkConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (link.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> LinkResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading link config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> LinkResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| LinkError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LinkError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| LinkError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Link config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> LinkResult<()> {
        let host = self.device.host.trim();
        if host.is_empty() {
            return Err(LinkError::InvalidConfig("device.host must not be empty".into()));
        }
        if host.contains("://") || host.contains('/') {
            return Err(LinkError::InvalidUrl(format!(
                "device.host must be a bare host[:port], got: {}",
                host
            )));
        }

        for (name, path) in [
            ("transport.ws_path", &self.transport.ws_path),
            ("upload.firmware_path", &self.upload.firmware_path),
            ("upload.filesystem_path", &self.upload.filesystem_path),
            ("status.path", &self.status.path),
        ] {
            if !path.starts_with('/') {
                return Err(LinkError::InvalidConfig(format!(
                    "{} must start with '/', got: {}",
                    name, path
                )));
            }
        }

        if self.upload.field_name.trim().is_empty() {
            return Err(LinkError::InvalidConfig(
                "upload.field_name must not be empty".into(),
            ));
        }

        if self.upload.near_complete_percent == 0 || self.upload.near_complete_percent > 100 {
            return Err(LinkError::InvalidConfig(format!(
                "upload.near_complete_percent must be in 1..=100, got {}",
                self.upload.near_complete_percent
            )));
        }

        for (name, value) in [
            ("transport.connect_timeout_ms", self.transport.connect_timeout_ms),
            ("transport.close_timeout_ms", self.transport.close_timeout_ms),
            ("transport.ping_interval_secs", self.transport.ping_interval_secs),
            ("upload.timeout_secs", self.upload.timeout_secs),
            ("reboot.reconnect_interval_ms", self.reboot.reconnect_interval_ms),
            ("reboot.fallback_ms", self.reboot.fallback_ms),
            ("reboot.reconnect_deadline_ms", self.reboot.reconnect_deadline_ms),
            ("status.interval_secs", self.status.interval_secs),
        ] {
            if value == 0 {
                return Err(LinkError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.reboot.ready_marker.trim().is_empty() {
            return Err(LinkError::InvalidConfig(
                "reboot.ready_marker must not be empty".into(),
            ));
        }

        self.backoff_policy()?;

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup (the environment in production).
    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("OTALINK_HOST") {
            debug!(host = %host, "Overriding device host from environment");
            self.device.host = host;
        }

        if let Some(tls) = lookup("OTALINK_TLS") {
            match tls.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.device.use_tls = true,
                "0" | "false" | "no" => self.device.use_tls = false,
                _ => warn!(value = %tls, "Unknown OTALINK_TLS value in environment"),
            }
        }

        if let Some(username) = lookup("OTALINK_USERNAME") {
            self.device.username = Some(username);
        }

        if let Some(password) = lookup("OTALINK_PASSWORD") {
            self.device.password = Some(password);
        }

        if let Some(marker) = lookup("OTALINK_READY_MARKER") {
            debug!(marker = %marker, "Overriding ready marker from environment");
            self.reboot.ready_marker = marker;
        }

        if let Some(fallback) = lookup("OTALINK_FALLBACK_MS") {
            match fallback.parse::<u64>() {
                Ok(ms) => self.reboot.fallback_ms = ms,
                Err(_) => warn!(value = %fallback, "Invalid OTALINK_FALLBACK_MS in environment"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "otalink", "otalink")
            .map(|dirs| dirs.config_dir().join("link.toml"))
    }

    // =========================================================================
    // Derived Values
    // =========================================================================

    /// WebSocket URL of the log stream.
    pub fn ws_url(&self) -> LinkResult<Url> {
        let scheme = if self.device.use_tls { "wss" } else { "ws" };
        self.url_for(scheme, &self.transport.ws_path)
    }

    /// Upload endpoint for `target`.
    pub fn upload_url(&self, target: UploadTarget) -> LinkResult<Url> {
        let path = match target {
            UploadTarget::Firmware => &self.upload.firmware_path,
            UploadTarget::Filesystem => &self.upload.filesystem_path,
        };
        Ok(self.http_base_url()?.join(path)?)
    }

    /// Status endpoint.
    pub fn status_url(&self) -> LinkResult<Url> {
        Ok(self.http_base_url()?.join(&self.status.path)?)
    }

    /// Basic-auth credentials, when a user name is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        self.device.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.device.password.clone().unwrap_or_default(),
        })
    }

    /// Reconnect delay policy.
    pub fn backoff_policy(&self) -> LinkResult<BackoffPolicy> {
        Ok(BackoffPolicy::new(
            Duration::from_millis(self.transport.reconnect_base_ms),
            Duration::from_millis(self.transport.reconnect_max_ms),
            self.transport.weak_signal_factor,
        )?)
    }

    /// Settings for the transport session.
    pub fn session_settings(&self) -> LinkResult<SessionSettings> {
        Ok(SessionSettings {
            policy: self.backoff_policy()?,
            weak_rssi_dbm: self.transport.weak_rssi_dbm,
            close_timeout: Duration::from_millis(self.transport.close_timeout_ms),
        })
    }

    /// Settings for the upload monitor.
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            grace: Duration::from_millis(self.upload.grace_ms),
            resolver: ResolverSettings {
                near_complete_percent: self.upload.near_complete_percent,
            },
        }
    }

    /// Timings for the reboot watcher.
    pub fn reboot_timings(&self) -> RebootTimings {
        RebootTimings {
            ready_marker: self.reboot.ready_marker.clone(),
            quiet_delay: Duration::from_millis(self.reboot.quiet_delay_ms),
            reconnect_interval: Duration::from_millis(self.reboot.reconnect_interval_ms),
            fallback: Duration::from_millis(self.reboot.fallback_ms),
            reconnect_deadline: Duration::from_millis(self.reboot.reconnect_deadline_ms),
        }
    }

    fn http_base_url(&self) -> LinkResult<Url> {
        let scheme = if self.device.use_tls { "https" } else { "http" };
        self.url_for(scheme, "/")
    }

    fn url_for(&self, scheme: &str, path: &str) -> LinkResult<Url> {
        Ok(Url::parse(&format!(
            "{}://{}{}",
            scheme,
            self.device.host.trim(),
            path
        ))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.field_name, "update");
        assert_eq!(config.reboot.reconnect_deadline_ms, 60_000);
        assert_eq!(config.reboot.fallback_ms, 8_000);
        assert_eq!(config.reboot.ready_marker, "=== Setup complete ===");
        assert!(config.status.enabled);
    }

    #[test]
    fn test_derived_urls() {
        let mut config = LinkConfig::default();
        config.device.host = "esp32.local:8080".into();
        assert_eq!(config.ws_url().unwrap().as_str(), "ws://esp32.local:8080/ws");
        assert_eq!(
            config.upload_url(UploadTarget::Firmware).unwrap().as_str(),
            "http://esp32.local:8080/update"
        );
        assert_eq!(
            config.upload_url(UploadTarget::Filesystem).unwrap().as_str(),
            "http://esp32.local:8080/update-fs"
        );

        config.device.use_tls = true;
        assert_eq!(config.ws_url().unwrap().scheme(), "wss");
        assert_eq!(
            config.status_url().unwrap().as_str(),
            "https://esp32.local:8080/api/status"
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = LinkConfig::default();

        config.device.host = "http://192.168.4.1".into();
        assert!(config.validate().unwrap_err().is_config_error());

        config.device.host = "192.168.4.1".into();
        config.upload.near_complete_percent = 0;
        assert!(config.validate().is_err());

        config.upload.near_complete_percent = 99;
        config.transport.reconnect_max_ms = 1_000;
        assert!(config.validate().is_err());

        config.transport.reconnect_max_ms = 30_000;
        config.status.path = "api/status".into();
        assert!(config.validate().is_err());

        config.status.path = "/api/status".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OTALINK_HOST", "10.0.0.7"),
            ("OTALINK_TLS", "yes"),
            ("OTALINK_USERNAME", "admin"),
            ("OTALINK_PASSWORD", "secret"),
            ("OTALINK_FALLBACK_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = LinkConfig::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.device.host, "10.0.0.7");
        assert!(config.device.use_tls);
        assert_eq!(
            config.credentials(),
            Some(Credentials {
                username: "admin".into(),
                password: "secret".into()
            })
        );
        assert_eq!(config.reboot.fallback_ms, 8_000);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("link.toml");

        let mut config = LinkConfig::default();
        config.device.host = "otalink-test.local".into();
        config.reboot.reconnect_deadline_ms = 45_000;
        config.save(Some(path.clone())).unwrap();

        let loaded = LinkConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.reboot.reconnect_deadline_ms, 45_000);
        assert_eq!(loaded.upload.grace_ms, 500);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.toml");
        std::fs::write(&path, "[reboot]\nfallback_ms = 3000\n").unwrap();

        let loaded = LinkConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.reboot.fallback_ms, 3_000);
        assert_eq!(loaded.reboot.quiet_delay_ms, 10_000);
        assert_eq!(loaded.transport.ws_path, "/ws");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.toml");
        std::fs::write(&path, "[device\nhost = ").unwrap();

        let err = LinkConfig::load(Some(path)).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_derived_settings() {
        let config = LinkConfig::default();
        let timings = config.reboot_timings();
        assert_eq!(timings.quiet_delay, Duration::from_secs(10));
        assert_eq!(timings.reconnect_deadline, Duration::from_secs(60));
        assert_eq!(config.monitor_settings().grace, Duration::from_millis(500));
        assert_eq!(
            config.session_settings().unwrap().policy.delay(0, true),
            Duration::from_secs(3)
        );
    }
}
