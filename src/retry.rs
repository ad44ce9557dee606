//! Bounded exponential backoff for transient engine failures.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{AppError, Result};

/// Doubling backoff with a delay cap and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Total attempts including the first one; at least 1.
    pub max_attempts: u32,
}

impl Backoff {
    /// Build a policy; `max_attempts` of zero is treated as one.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay that follows `current`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5), 5)
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or
/// `cancel` fires.
///
/// Only errors for which [`AppError::is_retryable`] holds are retried; the
/// last error is returned once attempts are exhausted.
///
/// # Errors
///
/// Returns the permanent or final error from `op`, or
/// [`AppError::Cancelled`] when `cancel` fires between attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    backoff: &Backoff,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;
    let mut attempt: u32 = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!("{operation} cancelled")));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < backoff.max_attempts => {
                warn!(
                    operation,
                    attempt,
                    %err,
                    delay = ?delay,
                    "transient failure; retrying"
                );
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(AppError::Cancelled(format!("{operation} cancelled")));
                    }
                    () = sleep(delay) => {}
                }
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
