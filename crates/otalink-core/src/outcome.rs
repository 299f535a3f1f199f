//! # Upload Outcome Resolution
//!
//! Turns the noisy signals of one upload request into exactly one terminal
//! outcome.
//!
//! ## Why This Is Hard
//! The device starts rebooting as soon as it has the whole image. From the
//! client's point of view the request then either answers 200, ends without
//! a response, errors out, or just goes quiet. All of those can happen after
//! a complete upload, and several can happen for the same request.
//!
//! ## Ranked Rules (first match commits)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Signal                        Condition             Outcome            │
//! │  ──────────────────────────────────────────────────────────────────     │
//! │  1. grace elapsed              progress = 100%       assumed success    │
//! │  2. response                   status 200            succeeded          │
//! │  3. response                   status ≠ 200          failed(status)     │
//! │  4. request ended              progress = 100%       assumed success    │
//! │                                progress < 100%       failed(incomplete) │
//! │  5. network error              progress ≥ threshold  assumed success    │
//! │  6. network error              progress < threshold  failed(transport)  │
//! │     timeout                    progress < 100%       failed(timed out)  │
//! │                                progress = 100%       assumed success    │
//! │                                                                         │
//! │  Reaching 100% does not commit anything by itself: it asks the caller  │
//! │  to start the grace timer (StartGrace). Any terminal signal before     │
//! │  the timer fires wins instead.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::latch::OneShot;

/// Default grace period after 100% progress, in milliseconds.
pub const DEFAULT_GRACE_MS: u64 = 500;

/// Default near-complete threshold for treating a network error as success.
pub const DEFAULT_NEAR_COMPLETE_PERCENT: u8 = 98;

// =============================================================================
// Signals
// =============================================================================

/// Raw signal reported by the HTTP upload transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSignal {
    /// Bytes handed to the transport so far.
    Progress { sent: u64, total: u64 },
    /// An HTTP response arrived.
    Response { status: u16 },
    /// The request finished, with or without a response.
    Ended,
    /// The connection failed at the network level.
    NetworkError(String),
    /// The request hit its timeout.
    TimedOut,
}

// =============================================================================
// Outcome
// =============================================================================

/// Why an upload failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The device answered with a non-200 status.
    HttpStatus { status: u16 },
    /// Network-level failure before the upload was near complete.
    Transport { message: String },
    /// The request timed out before the upload completed.
    TimedOut,
    /// The request ended without a response before the upload completed.
    Incomplete,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::HttpStatus { status } => write!(f, "device answered HTTP {}", status),
            FailureReason::Transport { message } => write!(f, "transport error: {}", message),
            FailureReason::TimedOut => write!(f, "upload timed out"),
            FailureReason::Incomplete => write!(f, "request ended before the upload completed"),
        }
    }
}

/// What convinced the resolver that an unconfirmed upload went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssumedSuccess {
    /// 100% sent, then nothing for the whole grace period.
    GraceElapsed,
    /// 100% sent, then the request ended without a response.
    EndedAfterComplete,
    /// Network error after at least `percent` was sent.
    ErrorNearComplete { percent: u8 },
    /// 100% sent, then the request timed out.
    TimeoutAfterComplete,
}

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    /// No terminal signal yet.
    #[default]
    Pending,
    /// The device confirmed with HTTP 200.
    Succeeded,
    /// Ambiguous signals resolved to success.
    AssumedSucceeded { evidence: AssumedSuccess },
    /// The upload failed; the user has to retry.
    Failed { reason: FailureReason },
}

impl UploadOutcome {
    /// Returns true for confirmed and assumed success.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            UploadOutcome::Succeeded | UploadOutcome::AssumedSucceeded { .. }
        )
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// What the caller must do after feeding a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing terminal yet.
    Pending,
    /// Progress just reached 100%: start the grace timer.
    StartGrace,
    /// This signal committed the outcome.
    Resolved(UploadOutcome),
    /// The outcome was already committed; the signal was dropped.
    Ignored,
}

/// Tunables for the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverSettings {
    /// Minimum progress for a network error to count as success.
    pub near_complete_percent: u8,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        ResolverSettings {
            near_complete_percent: DEFAULT_NEAR_COMPLETE_PERCENT,
        }
    }
}

/// Ranked-rule resolver for one upload attempt.
#[derive(Debug, Clone)]
pub struct OutcomeResolver {
    settings: ResolverSettings,
    last_percent: u8,
    complete: bool,
    outcome: OneShot<UploadOutcome>,
}

impl OutcomeResolver {
    /// Creates a resolver for a fresh attempt.
    pub fn new(settings: ResolverSettings) -> Self {
        OutcomeResolver {
            settings,
            last_percent: 0,
            complete: false,
            outcome: OneShot::new(),
        }
    }

    /// Last observed progress in whole percent (floored).
    pub fn percent(&self) -> u8 {
        self.last_percent
    }

    /// Returns true once every byte was handed to the transport.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Current outcome; `Pending` until the latch fires.
    pub fn outcome(&self) -> UploadOutcome {
        self.outcome.get().cloned().unwrap_or_default()
    }

    /// Feeds one transport signal.
    pub fn on_signal(&mut self, signal: &UploadSignal) -> Resolution {
        if self.outcome.is_fired() {
            return Resolution::Ignored;
        }

        match signal {
            UploadSignal::Progress { sent, total } => {
                self.last_percent = self.last_percent.max(percent_of(*sent, *total));
                if *total > 0 && sent >= total && !self.complete {
                    self.complete = true;
                    return Resolution::StartGrace;
                }
                Resolution::Pending
            }
            UploadSignal::Response { status: 200 } => self.commit(UploadOutcome::Succeeded),
            UploadSignal::Response { status } => self.commit(UploadOutcome::Failed {
                reason: FailureReason::HttpStatus { status: *status },
            }),
            UploadSignal::Ended => {
                if self.complete {
                    self.commit(UploadOutcome::AssumedSucceeded {
                        evidence: AssumedSuccess::EndedAfterComplete,
                    })
                } else {
                    self.commit(UploadOutcome::Failed {
                        reason: FailureReason::Incomplete,
                    })
                }
            }
            UploadSignal::NetworkError(message) => {
                if self.complete || self.last_percent >= self.settings.near_complete_percent {
                    self.commit(UploadOutcome::AssumedSucceeded {
                        evidence: AssumedSuccess::ErrorNearComplete {
                            percent: self.last_percent,
                        },
                    })
                } else {
                    self.commit(UploadOutcome::Failed {
                        reason: FailureReason::Transport {
                            message: message.clone(),
                        },
                    })
                }
            }
            UploadSignal::TimedOut => {
                if self.complete {
                    self.commit(UploadOutcome::AssumedSucceeded {
                        evidence: AssumedSuccess::TimeoutAfterComplete,
                    })
                } else {
                    self.commit(UploadOutcome::Failed {
                        reason: FailureReason::TimedOut,
                    })
                }
            }
        }
    }

    /// Called when the grace timer started by `StartGrace` fires.
    pub fn on_grace_elapsed(&mut self) -> Resolution {
        if self.outcome.is_fired() {
            return Resolution::Ignored;
        }
        if !self.complete {
            return Resolution::Pending;
        }
        self.commit(UploadOutcome::AssumedSucceeded {
            evidence: AssumedSuccess::GraceElapsed,
        })
    }

    fn commit(&mut self, outcome: UploadOutcome) -> Resolution {
        if self.outcome.fire(outcome.clone()) {
            Resolution::Resolved(outcome)
        } else {
            Resolution::Ignored
        }
    }
}

/// Whole percent of `sent` over `total`, rounded half up. Stays at 99 until
/// every byte is sent, so 100 always means complete.
pub fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    if sent >= total {
        return 100;
    }
    let percent = (u128::from(sent) * 200 + u128::from(total)) / (u128::from(total) * 2);
    percent.min(99) as u8
}
