//! Optional one-shot timers that live inside actor state.
//!
//! A timer is `None` when disarmed; awaiting a disarmed timer pends forever,
//! so it can sit in a `select!` branch unconditionally. A fired timer must be
//! reset to `None` by the caller before it is polled again.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::Sleep;

/// A disarmable deadline owned by a state machine.
pub(crate) type Timer = Option<Pin<Box<Sleep>>>;

/// Arms a timer firing `after` from now.
pub(crate) fn start(after: Duration) -> Timer {
    Some(Box::pin(tokio::time::sleep(after)))
}

/// Completes when the timer fires. Cancel-safe.
pub(crate) async fn fired(timer: &mut Timer) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
