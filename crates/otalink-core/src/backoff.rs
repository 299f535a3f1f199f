//! # Reconnect Backoff Policy
//!
//! Pure delay calculation for the normal (non-reboot) reconnect loop.
//!
//! ## Delay Curve
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 delay(attempt, weak) = clamp(B · 2^a · f, B, M)         │
//! │                                                                         │
//! │  attempt │ normal (f = 1.0) │ weak signal (f = 1.5)                    │
//! │  ────────┼──────────────────┼──────────────────────                    │
//! │     0    │      2s          │      3s                                  │
//! │     1    │      4s          │      6s                                  │
//! │     2    │      8s          │     12s                                  │
//! │     3    │     16s          │     24s                                  │
//! │     4    │     30s (cap)    │     30s (cap)                            │
//! │                                                                         │
//! │  No jitter: the same inputs always give the same delay.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Largest exponent applied before the cap; 2^20 · any sane base is far
/// beyond every reasonable maximum delay.
const MAX_EXPONENT: u32 = 20;

/// Default base delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2_000);

/// Default maximum delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Default multiplier applied on a weak Wi-Fi signal.
pub const DEFAULT_WEAK_SIGNAL_FACTOR: f64 = 1.5;

/// Exponential reconnect delay, stretched when the link is known to be weak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    weak_signal_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
            weak_signal_factor: DEFAULT_WEAK_SIGNAL_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy, rejecting parameters that break the floor/cap contract.
    pub fn new(base: Duration, max: Duration, weak_signal_factor: f64) -> CoreResult<Self> {
        if base.is_zero() {
            return Err(CoreError::InvalidPolicy("base delay must be non-zero".into()));
        }
        if max < base {
            return Err(CoreError::InvalidPolicy(format!(
                "max delay {:?} is below base delay {:?}",
                max, base
            )));
        }
        if !weak_signal_factor.is_finite() || weak_signal_factor < 1.0 {
            return Err(CoreError::InvalidPolicy(format!(
                "weak signal factor must be >= 1.0, got {}",
                weak_signal_factor
            )));
        }

        Ok(BackoffPolicy {
            base,
            max,
            weak_signal_factor,
        })
    }

    /// Returns the base delay.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Returns the maximum delay.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Computes the delay before reconnect attempt number `attempt`.
    ///
    /// Never returns less than the base delay or more than the maximum.
    pub fn delay(&self, attempt: u32, weak_signal: bool) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT);
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let mut delay_ms = base_ms.saturating_mul(1u64 << exponent) as f64;

        if weak_signal {
            delay_ms *= self.weak_signal_factor;
        }

        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
        delay.clamp(self.base, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_curve() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0, false), Duration::from_secs(2));
        assert_eq!(policy.delay(1, false), Duration::from_secs(4));
        assert_eq!(policy.delay(2, false), Duration::from_secs(8));
        assert_eq!(policy.delay(3, false), Duration::from_secs(16));
        assert_eq!(policy.delay(4, false), Duration::from_secs(30));
    }

    #[test]
    fn test_weak_signal_stretches_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0, true), Duration::from_secs(3));
        assert_eq!(policy.delay(2, true), Duration::from_secs(12));
        assert_eq!(policy.delay(3, true), Duration::from_secs(24));
    }

    #[test]
    fn test_non_decreasing_and_capped() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let normal = policy.delay(attempt, false);
            let weak = policy.delay(attempt, true);
            assert!(normal >= previous, "attempt {attempt} went backwards");
            assert!(normal <= policy.max());
            assert!(normal >= policy.base());
            assert!(weak >= normal);
            assert!(weak <= policy.max());
            previous = normal;
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(3600),
            Duration::from_secs(u64::MAX / 2_000),
            4.0,
        )
        .unwrap();
        let delay = policy.delay(u32::MAX, true);
        assert!(delay <= policy.max());
        assert!(delay >= policy.base());
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(BackoffPolicy::new(Duration::ZERO, Duration::from_secs(1), 1.0).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1), 1.0).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 0.5).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5), f64::NAN).is_err());
    }
}
