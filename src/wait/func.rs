//! Wait on a caller-supplied async predicate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::{Readiness, WaitLoop, WaitSettings, WaitStrategy, WaitTarget};
use crate::Result;

type ReadyCheck =
    Arc<dyn for<'a> Fn(&'a dyn WaitTarget) -> BoxFuture<'a, Result<bool>> + Send + Sync>;

/// Ready once the predicate returns `Ok(true)`.
///
/// ```ignore
/// let strategy = ForFunc::new(|target| Box::pin(async move {
///     Ok(target.logs().await.is_ok())
/// }));
/// ```
#[derive(Clone)]
pub struct ForFunc {
    check: ReadyCheck,
    settings: WaitSettings,
}

impl ForFunc {
    /// Wrap `check`.
    #[must_use]
    pub fn new<F>(check: F) -> Self
    where
        F: for<'a> Fn(&'a dyn WaitTarget) -> BoxFuture<'a, Result<bool>> + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
            settings: WaitSettings::default(),
        }
    }

    /// Override the startup timeout.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.settings.startup_timeout = timeout;
        self
    }

    /// Override the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }
}

impl fmt::Debug for ForFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForFunc")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl WaitStrategy for ForFunc {
    fn wait_until_ready<'a>(
        &'a self,
        target: &'a dyn WaitTarget,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut wait = WaitLoop::new("custom predicate", self.settings);
            wait.run(cancel, || async move {
                (self.check)(target).await.map(|ready| {
                    if ready {
                        Readiness::Ready
                    } else {
                        Readiness::not_ready("predicate returned false")
                    }
                })
            })
            .await
        })
    }
}
