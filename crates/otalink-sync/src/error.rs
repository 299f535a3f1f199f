//! # Link Error Types
//!
//! Error types for link operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Link Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Upload              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  HttpError              │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  ReadPayload            │ │
//! │  │  ConfigLoad     │  │  Timeout        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Contract (fail fast, no retry) │  │      Internal               │  │
//! │  │                                 │  │                             │  │
//! │  │  InvalidPayload  NotConnected   │  │  ShuttingDown               │  │
//! │  │  UploadInProgress               │  │                             │  │
//! │  │  RebootInProgress               │  │                             │  │
//! │  └─────────────────────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport errors never reach callers of `send`/`upload`: the session turns
//! them into reconnects. They exist so connectors can report what happened.

use thiserror::Error;

use otalink_core::CoreError;

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Link error type covering all possible link failures.
#[derive(Debug, Error)]
pub enum LinkError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid link configuration.
    #[error("Invalid link configuration: {0}")]
    InvalidConfig(String),

    /// Invalid device URL.
    #[error("Invalid device URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket disconnected unexpectedly.
    #[error("Disconnected from device")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} ms")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Upload Errors
    // =========================================================================
    /// HTTP client error outside of an upload attempt (building a client,
    /// polling status).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Failed to read the image file.
    #[error("Failed to read payload: {0}")]
    ReadPayload(String),

    // =========================================================================
    // Contract Errors
    // =========================================================================
    /// Upload payload is empty.
    #[error("Upload payload is empty")]
    InvalidPayload,

    /// `send` while the socket is not open.
    #[error("Not connected to device")]
    NotConnected,

    /// Another upload attempt has not resolved yet.
    #[error("An upload is already in progress")]
    UploadInProgress,

    /// The device is rebooting after an update.
    #[error("Device is rebooting after an update")]
    RebootInProgress,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Link manager is shutting down.
    #[error("Link manager is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for LinkError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidPayload => LinkError::InvalidPayload,
            CoreError::InvalidPolicy(msg) => LinkError::InvalidConfig(msg),
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::HttpError(format!("invalid JSON: {}", err))
    }
}

impl From<url::ParseError> for LinkError {
    fn from(err: url::ParseError) -> Self {
        LinkError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => LinkError::Disconnected,
            WsError::AlreadyClosed => LinkError::Disconnected,
            WsError::Protocol(p) => LinkError::WebSocketError(p.to_string()),
            WsError::Io(io) => LinkError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => LinkError::TlsError(tls.to_string()),
            other => LinkError::WebSocketError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for LinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LinkError::Timeout(0)
        } else if err.is_connect() {
            LinkError::ConnectionFailed(err.to_string())
        } else {
            LinkError::HttpError(err.to_string())
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        LinkError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for LinkError {
    fn from(err: toml::ser::Error) -> Self {
        LinkError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl LinkError {
    /// Returns true if this error is transient and the reconnect loop will
    /// deal with it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionFailed(_)
                | LinkError::Disconnected
                | LinkError::Timeout(_)
                | LinkError::WebSocketError(_)
                | LinkError::TlsError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            LinkError::InvalidConfig(_)
                | LinkError::InvalidUrl(_)
                | LinkError::ConfigLoadFailed(_)
                | LinkError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the caller broke the contract (fail fast, never retried).
    pub fn is_contract_error(&self) -> bool {
        matches!(
            self,
            LinkError::InvalidPayload
                | LinkError::NotConnected
                | LinkError::UploadInProgress
                | LinkError::RebootInProgress
        )
    }
}
