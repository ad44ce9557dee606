//! Composite strategy: every child must become ready.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{WaitStrategy, WaitTarget, DEFAULT_STARTUP_TIMEOUT};
use crate::{AppError, Result};

/// Runs children in order under one shared deadline.
///
/// Each child still applies its own startup timeout; whichever limit is
/// reached first fails the wait.
#[derive(Clone)]
pub struct AllStrategy {
    strategies: Vec<Arc<dyn WaitStrategy>>,
    startup_timeout: Duration,
}

impl AllStrategy {
    /// Compose `strategies`.
    #[must_use]
    pub fn new(strategies: Vec<Arc<dyn WaitStrategy>>) -> Self {
        Self {
            strategies,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Override the shared deadline.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

impl fmt::Debug for AllStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllStrategy")
            .field("strategies", &self.strategies.len())
            .field("startup_timeout", &self.startup_timeout)
            .finish()
    }
}

impl WaitStrategy for AllStrategy {
    fn wait_until_ready<'a>(
        &'a self,
        target: &'a dyn WaitTarget,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let all = async {
                for (index, strategy) in self.strategies.iter().enumerate() {
                    strategy.wait_until_ready(target, cancel).await?;
                    debug!(index, "child strategy ready");
                }
                Ok::<(), AppError>(())
            };

            tokio::time::timeout(self.startup_timeout, all)
                .await
                .map_err(|_| {
                    AppError::Timeout(format!(
                        "{} strategies not ready after {}ms",
                        self.strategies.len(),
                        self.startup_timeout.as_millis()
                    ))
                })?
        })
    }
}
