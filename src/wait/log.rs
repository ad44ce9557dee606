//! Wait for a log line to appear a number of times.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use regex::Regex;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::{Readiness, WaitLoop, WaitSettings, WaitStrategy, WaitTarget};
use crate::logs::lines::LogLineCodec;
use crate::{AppError, Result};

/// Ready once the session's output contains enough matching lines.
///
/// Every poll re-reads the log from the beginning and counts line chunks
/// containing the substring, or matching the pattern after [`as_regex`].
/// A match never spans two chunks of one overlong line.
///
/// [`as_regex`]: LogStrategy::as_regex
#[derive(Debug, Clone)]
pub struct LogStrategy {
    needle: String,
    pattern: Option<Regex>,
    occurrence: usize,
    settings: WaitSettings,
}

impl LogStrategy {
    /// Wait for one line containing `needle`.
    #[must_use]
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            pattern: None,
            occurrence: 1,
            settings: WaitSettings::default(),
        }
    }

    /// Require `occurrence` matching lines (minimum 1).
    #[must_use]
    pub fn with_occurrence(mut self, occurrence: usize) -> Self {
        self.occurrence = occurrence.max(1);
        self
    }

    /// Treat the needle as a regular expression.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the needle is not a valid pattern.
    pub fn as_regex(mut self) -> Result<Self> {
        let pattern = Regex::new(&self.needle)
            .map_err(|err| AppError::Config(format!("invalid log pattern '{}': {err}", self.needle)))?;
        self.pattern = Some(pattern);
        Ok(self)
    }

    /// Override the startup timeout.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.settings.startup_timeout = timeout;
        self
    }

    /// Override the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    fn matches(&self, line: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(line),
            None => line.contains(&self.needle),
        }
    }

    async fn count_matches(&self, target: &dyn WaitTarget) -> Result<Readiness> {
        let stream = target.logs().await?;
        let mut lines = FramedRead::new(stream, LogLineCodec::new());
        let mut seen = 0usize;

        while let Some(line) = lines.next().await {
            if self.matches(&line?.text()) {
                seen += 1;
                if seen >= self.occurrence {
                    return Ok(Readiness::Ready);
                }
            }
        }

        Ok(Readiness::not_ready(format!(
            "{seen} of {} matching lines",
            self.occurrence
        )))
    }
}

impl WaitStrategy for LogStrategy {
    fn wait_until_ready<'a>(
        &'a self,
        target: &'a dyn WaitTarget,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut wait = WaitLoop::new(format!("log '{}'", self.needle), self.settings);
            wait.run(cancel, || self.count_matches(target)).await
        })
    }
}
