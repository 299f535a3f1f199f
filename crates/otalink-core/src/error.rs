//! # Error Types
//!
//! Contract errors for otalink-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  otalink-core errors (this file)                                       │
//! │  └── CoreError        - Contract violations caught before any I/O      │
//! │                                                                         │
//! │  otalink-sync errors (separate crate)                                  │
//! │  └── LinkError        - Transport, upload, config and contract errors  │
//! │                                                                         │
//! │  Flow: CoreError → LinkError → presentation                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient transport problems never show up here: they are recovered by
//! the reconnect loops and only ever surface as events.

use thiserror::Error;

/// Errors raised synchronously by the pure link logic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// An upload was requested with an empty byte payload.
    ///
    /// ## When This Occurs
    /// - The selected image file is zero bytes long
    /// - The caller passed an empty buffer by mistake
    ///
    /// Raised before any request is issued; nothing is retried.
    #[error("Upload payload is empty")]
    InvalidPayload,

    /// Backoff or resolver parameters make no sense (e.g. max below base).
    #[error("Invalid link policy: {0}")]
    InvalidPolicy(String),
}

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
