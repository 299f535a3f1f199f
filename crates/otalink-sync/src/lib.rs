//! # otalink-sync: Device Link Runtime
//!
//! Keeps a host connected to an embedded device over flaky Wi-Fi and carries
//! it through the reboot that follows a firmware or filesystem update.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Link Manager Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  LinkManager (single actor task)                 │  │
//! │  │                                                                  │  │
//! │  │  Owns all link state, select!s over commands and components      │  │
//! │  │  Emits one ordered LinkEvent stream                              │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │TransportSession│  │ UploadMonitor  │  │  RebootWatcher         │    │
//! │  │                │  │                │  │                        │    │
//! │  │ WebSocket with │  │ Multipart POST │  │ Quiet delay, fixed     │    │
//! │  │ backoff and    │  │ resolved to    │  │ retries, marker vs.    │    │
//! │  │ close classes  │  │ one outcome    │  │ fallback race          │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐                                │
//! │  │ StatusPoller   │  │ LinkConfig     │                                │
//! │  │ RSSI → backoff │  │ TOML + env     │                                │
//! │  └────────────────┘  └────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`manager`] - `LinkManager` actor and its `LinkHandle`
//! - [`transport`] - Streaming socket session and connectors
//! - [`upload`] - Upload monitor and HTTP uploader
//! - [`reboot`] - Post-update reboot watcher
//! - [`status`] - Device status poller
//! - [`config`] - Link configuration
//! - [`error`] - Link error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use otalink_sync::{HttpUploader, LinkConfig, LinkManager, ManagerSettings, WsConnector};
//!
//! let config = LinkConfig::load(None)?;
//! let (handle, mut events, _task) = LinkManager::spawn(
//!     Arc::new(WsConnector::from_config(&config)?),
//!     Arc::new(HttpUploader::from_config(&config)?),
//!     ManagerSettings::from_config(&config)?,
//! );
//!
//! handle.upload(UploadTarget::Firmware, "firmware.bin", image).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod manager;
pub mod reboot;
pub mod status;
pub mod transport;
pub mod upload;

mod timer;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{Credentials, LinkConfig};
pub use error::{LinkError, LinkResult};
pub use manager::{LinkHandle, LinkManager, LinkStatus, ManagerSettings};
pub use reboot::{RebootTimings, RebootWatcher, WatcherEvent};
pub use status::StatusPoller;
pub use transport::{
    Connection, Connector, Outbound, RemoteEnd, SessionEvent, SessionSettings, SocketEvent,
    TransportSession, WsConnector,
};
pub use upload::{HttpUploader, MonitorEvent, MonitorSettings, UploadMonitor, UploadRequest, Uploader};
