//! Readiness waits.
//!
//! A [`WaitStrategy`] blocks [`Session::start`](crate::session::Session::start)
//! until some externally observable condition holds. Every strategy drives the
//! same [`WaitLoop`]:
//!
//! ```text
//! Pending ──▶ Polling ──▶ Ready
//!                │
//!                └──────▶ Failed (timeout, cancellation, permanent error)
//! ```
//!
//! Strategies keep no state between calls; each `wait_until_ready` is
//! self-contained and may be repeated.

pub mod all;
pub mod func;
pub mod http;
pub mod log;

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use all::AllStrategy;
pub use func::ForFunc;
pub use http::HttpStrategy;
pub use log::LogStrategy;

use crate::engine::{ExposedPort, LogStream};
use crate::{AppError, Result};

/// Default limit for one `wait_until_ready` call.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a readiness check can observe about a started session.
pub trait WaitTarget: Send + Sync {
    /// Host where mapped ports are reachable.
    fn host(&self) -> BoxFuture<'_, Result<String>>;

    /// Host port bound to `port` inside the session.
    fn mapped_port(&self, port: ExposedPort) -> BoxFuture<'_, Result<u16>>;

    /// Ports the session exposes.
    fn exposed_ports(&self) -> Vec<ExposedPort>;

    /// The full log output so far, in multiplexed form, without following.
    fn logs(&self) -> BoxFuture<'_, Result<LogStream>>;
}

/// A readiness check.
pub trait WaitStrategy: Send + Sync {
    /// Block until `target` is ready.
    ///
    /// # Errors
    ///
    /// - `AppError::Timeout` once the startup timeout has elapsed.
    /// - `AppError::Cancelled` when `cancel` fires first.
    /// - Any permanent error reported by `target`.
    fn wait_until_ready<'a>(
        &'a self,
        target: &'a dyn WaitTarget,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Condition satisfied.
    Ready,
    /// Condition not satisfied yet.
    NotReady {
        /// What the poll saw, for the timeout message.
        last_observed: Option<String>,
    },
}

impl Readiness {
    /// Convenience constructor for `NotReady`.
    #[must_use]
    pub fn not_ready(last_observed: impl Into<String>) -> Self {
        Self::NotReady {
            last_observed: Some(last_observed.into()),
        }
    }
}

/// Where a wait loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Not started.
    Pending,
    /// Polling the condition.
    Polling,
    /// Condition held.
    Ready,
    /// Timed out, cancelled or hit a permanent error.
    Failed,
}

/// Timeout and poll interval shared by every strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSettings {
    /// Overall limit.
    pub startup_timeout: Duration,
    /// Delay between polls.
    pub poll_interval: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// The polling, timeout and cancellation loop behind every strategy.
#[derive(Debug)]
pub struct WaitLoop {
    description: String,
    settings: WaitSettings,
    state: WaitState,
    attempts: u32,
}

impl WaitLoop {
    /// A loop in the `Pending` state.
    #[must_use]
    pub fn new(description: impl Into<String>, settings: WaitSettings) -> Self {
        Self {
            description: description.into(),
            settings,
            state: WaitState::Pending,
            attempts: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WaitState {
        self.state
    }

    /// Polls performed so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Poll `check` until it reports ready.
    ///
    /// Transient errors from `check` count as "not ready"; permanent ones
    /// (not-found, invalid state, cancellation) fail the wait at once. The
    /// deadline is measured from this call.
    ///
    /// # Errors
    ///
    /// `AppError::Timeout`, `AppError::Cancelled` or the permanent error.
    pub async fn run<F, Fut>(&mut self, cancel: &CancellationToken, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Readiness>>,
    {
        let started = Instant::now();
        let deadline = started + self.settings.startup_timeout;
        let mut last_observed: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(self.fail_cancelled());
            }

            self.state = WaitState::Polling;
            self.attempts += 1;

            let poll = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.fail_cancelled()),
                () = sleep_until(deadline) => None,
                poll = check() => Some(poll),
            };

            match poll {
                Some(Ok(Readiness::Ready)) => {
                    self.state = WaitState::Ready;
                    debug!(
                        strategy = %self.description,
                        attempts = self.attempts,
                        elapsed_ms = started.elapsed().as_millis(),
                        "ready"
                    );
                    return Ok(());
                }
                Some(Ok(Readiness::NotReady { last_observed: seen })) => {
                    if seen.is_some() {
                        last_observed = seen;
                    }
                }
                Some(Err(err)) if ends_wait(&err) => {
                    self.state = WaitState::Failed;
                    return Err(err.context(format!("waiting for {}", self.description)));
                }
                Some(Err(err)) => last_observed = Some(err.to_string()),
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.fail_timeout(started, last_observed.as_deref()));
            }

            let pause = self.settings.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.fail_cancelled()),
                () = sleep(pause) => {}
            }
        }
    }

    fn fail_cancelled(&mut self) -> AppError {
        self.state = WaitState::Failed;
        AppError::Cancelled(format!("waiting for {}", self.description))
    }

    fn fail_timeout(&mut self, started: Instant, last_observed: Option<&str>) -> AppError {
        self.state = WaitState::Failed;
        AppError::Timeout(format!(
            "{} not ready after {}ms ({} attempts, last observed: {})",
            self.description,
            started.elapsed().as_millis(),
            self.attempts,
            last_observed.unwrap_or("<none>")
        ))
    }
}

/// Errors that make further polling pointless.
fn ends_wait(err: &AppError) -> bool {
    matches!(
        err,
        AppError::NotFound(_) | AppError::InvalidState(_) | AppError::Cancelled(_)
    )
}
