//! # otalink-core: Pure Link-Lifecycle Logic
//!
//! The decision-making half of the device link, with zero I/O. Every type in
//! here is a plain state machine that is fed signals and deadlines by the
//! async layer (`otalink-sync`) and answers what they mean.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         otalink Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Presentation (otalink CLI)                       │   │
//! │  │        renders LinkEvent: progress, outcome, device ready        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ LinkEvent stream                       │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              otalink-sync (LinkManager actor)                    │   │
//! │  │     sockets, HTTP uploads, timers, reconnect loops               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ signals / deadlines                    │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ otalink-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  backoff  │  │  outcome  │  │  reboot   │  │   lines   │  │   │
//! │  │   │  Backoff  │  │  Outcome  │  │  Reboot   │  │  split +  │  │   │
//! │  │   │  Policy   │  │  Resolver │  │  Wait     │  │  marker   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO SOCKETS • NO TIMERS • NO ASYNC                            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`backoff`] - Reconnect delay policy
//! - [`latch`] - One-shot latch guarding terminal decisions
//! - [`outcome`] - Upload outcome resolver
//! - [`reboot`] - Reboot wait phases
//! - [`lines`] - Payload splitting and marker matching
//! - [`types`] - Connection state, targets, link quality, events
//! - [`error`] - Contract errors
//!
//! ## Example Usage
//!
//! ```rust
//! use otalink_core::outcome::{OutcomeResolver, Resolution, ResolverSettings, UploadSignal};
//!
//! let mut resolver = OutcomeResolver::new(ResolverSettings::default());
//! resolver.on_signal(&UploadSignal::Progress { sent: 990, total: 1000 });
//!
//! // The device rebooted mid-response: still counts as success at 99%.
//! let resolution = resolver.on_signal(&UploadSignal::NetworkError("reset".into()));
//! assert!(matches!(resolution, Resolution::Resolved(ref o) if o.is_success()));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backoff;
pub mod error;
pub mod latch;
pub mod lines;
pub mod outcome;
pub mod reboot;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use backoff::BackoffPolicy;
pub use error::{CoreError, CoreResult};
pub use latch::OneShot;
pub use outcome::{
    AssumedSuccess, FailureReason, OutcomeResolver, Resolution, ResolverSettings, UploadOutcome,
    UploadSignal,
};
pub use reboot::{ReadyCause, RebootPhase, RebootWait};
pub use types::*;

/// Validates an upload payload before anything touches the network.
pub fn validate_payload(bytes: &[u8]) -> CoreResult<()> {
    if bytes.is_empty() {
        return Err(CoreError::InvalidPayload);
    }
    Ok(())
}
