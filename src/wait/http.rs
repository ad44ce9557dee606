//! Wait for an HTTP endpoint inside the session to answer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::{Client, Method};
use tokio_util::sync::CancellationToken;

use super::{Readiness, WaitLoop, WaitSettings, WaitStrategy, WaitTarget};
use crate::engine::ExposedPort;
use crate::{AppError, Result};

type StatusPredicate = Arc<dyn Fn(u16) -> bool + Send + Sync>;
type BodyMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Per-request limit, further bounded by the wait's own deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Ready on the first accepted response from `path`.
///
/// The polled port is the configured one or, when none is set, the lowest
/// port the session exposes. Connection failures, unmapped ports and
/// rejected statuses all mean "not ready yet".
#[derive(Clone)]
pub struct HttpStrategy {
    path: String,
    port: Option<ExposedPort>,
    tls: bool,
    insecure: bool,
    method: Method,
    body: Option<String>,
    headers: Vec<(String, String)>,
    status: StatusPredicate,
    matcher: Option<BodyMatcher>,
    settings: WaitSettings,
}

impl HttpStrategy {
    /// Poll `path` with `GET`, accepting any 2xx or 3xx status.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            path,
            port: None,
            tls: false,
            insecure: false,
            method: Method::GET,
            body: None,
            headers: Vec::new(),
            status: Arc::new(|status| (200..400).contains(&status)),
            matcher: None,
            settings: WaitSettings::default(),
        }
    }

    /// Poll this internal port instead of the lowest exposed one.
    #[must_use]
    pub fn with_port(mut self, port: ExposedPort) -> Self {
        self.port = Some(port);
        self
    }

    /// Use `https`.
    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Use `https` without verifying the certificate chain.
    #[must_use]
    pub fn with_insecure_tls(mut self) -> Self {
        self.tls = true;
        self.insecure = true;
        self
    }

    /// Request method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Add a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Accept statuses for which `predicate` holds.
    #[must_use]
    pub fn with_status_codes<F>(mut self, predicate: F) -> Self
    where
        F: Fn(u16) -> bool + Send + Sync + 'static,
    {
        self.status = Arc::new(predicate);
        self
    }

    /// Additionally require the response body to satisfy `matcher`.
    #[must_use]
    pub fn with_response_matcher<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.matcher = Some(Arc::new(matcher));
        self
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

    fn client(&self) -> Result<Client> {
        Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(self.insecure)
            .build()
            .map_err(|err| AppError::Http(format!("failed to build http client: {err}")))
    }

    async fn check(&self, client: &Client, target: &dyn WaitTarget) -> Result<Readiness> {
        let port = match self.port {
            Some(port) => port,
            None => target.exposed_ports().into_iter().min().ok_or_else(|| {
                AppError::InvalidState("http wait needs an exposed port".into())
            })?,
        };

        let host = target.host().await?;
        let host_port = target.mapped_port(port).await?;
        let scheme = if self.tls { "https" } else { "http" };
        let url = if host.contains(':') {
            format!("{scheme}://[{host}]:{host_port}{}", self.path)
        } else {
            format!("{scheme}://{host}:{host_port}{}", self.path)
        };

        let mut request = client.request(self.method.clone(), &url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Ok(Readiness::not_ready(format!("{url}: {err}"))),
        };

        let status = response.status().as_u16();
        if !(self.status)(status) {
            return Ok(Readiness::not_ready(format!("{url}: status {status}")));
        }

        if let Some(matcher) = &self.matcher {
            let body = match response.text().await {
                Ok(body) => body,
                Err(err) => return Ok(Readiness::not_ready(format!("{url}: {err}"))),
            };
            if !matcher(&body) {
                return Ok(Readiness::not_ready(format!(
                    "{url}: response body did not match"
                )));
            }
        }

        Ok(Readiness::Ready)
    }
}

impl fmt::Debug for HttpStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStrategy")
            .field("path", &self.path)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("method", &self.method)
            .field("has_matcher", &self.matcher.is_some())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl WaitStrategy for HttpStrategy {
    fn wait_until_ready<'a>(
        &'a self,
        target: &'a dyn WaitTarget,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let client = self.client()?;
            let mut wait = WaitLoop::new(format!("http {} {}", self.method, self.path), self.settings);
            wait.run(cancel, || self.check(&client, target)).await
        })
    }
}
