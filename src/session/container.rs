//! One provisioned container.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BerthConfig;
use crate::engine::{Engine, ExposedPort, Labels, LogOptions, LogStream, RemoveOptions, ResourceId};
use crate::logs::{ConsumerList, LogConsumer, LogProducer};
use crate::reaper::{TerminationSignal, LABEL_SESSION_GROUP};
use crate::retry::{retry_with_backoff, Backoff};
use crate::wait::{WaitStrategy, WaitTarget};
use crate::{AppError, Result};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not started (or start did not pass its wait strategy).
    Created,
    /// Started and ready.
    Running,
    /// Stopped; may be started again.
    Stopped,
    /// Removed; every further operation fails.
    Terminated,
}

impl SessionState {
    /// Lowercase state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        }
    }
}

/// A container created through a [`Provider`](super::Provider).
///
/// Owned exclusively by the caller. Dropping it stops the log producer but
/// leaves the container to [`terminate`](Self::terminate) or the reaper.
pub struct Session {
    id: ResourceId,
    engine: Arc<dyn Engine>,
    labels: Labels,
    exposed_ports: Vec<ExposedPort>,
    host_override: Option<String>,
    wait: Option<Arc<dyn WaitStrategy>>,
    termination: Option<TerminationSignal>,
    consumers: ConsumerList,
    producer: Option<LogProducer>,
    logs_backoff: Backoff,
    state: SessionState,
}

impl Session {
    pub(super) fn new(
        id: ResourceId,
        engine: Arc<dyn Engine>,
        config: &BerthConfig,
        labels: Labels,
        exposed_ports: Vec<ExposedPort>,
        wait: Option<Arc<dyn WaitStrategy>>,
        termination: Option<TerminationSignal>,
    ) -> Self {
        Self {
            id,
            engine,
            labels,
            exposed_ports,
            host_override: config.host.clone(),
            wait,
            termination,
            consumers: ConsumerList::new(),
            producer: None,
            logs_backoff: config.logs.backoff(),
            state: SessionState::Created,
        }
    }

    /// Engine handle.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Labels the resource was created with.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session group the reaper watches this session under; `None` when it skips reaping.
    #[must_use]
    pub fn session_group(&self) -> Option<Uuid> {
        self.labels
            .get(LABEL_SESSION_GROUP)
            .and_then(|group| Uuid::parse_str(group).ok())
    }

    /// Start the container and block on its wait strategy, if any.
    ///
    /// The session only becomes `Running` once the strategy passes; on a
    /// readiness failure the container is left running for inspection.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` once terminated.
    /// - `AppError::Cancelled` when `cancel` fires.
    /// - The engine's or the wait strategy's error.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live("start")?;
        if self.state == SessionState::Running {
            debug!(resource = %self.id, "session already running");
            return Ok(());
        }

        let engine = &self.engine;
        let id = &self.id;
        retry_with_backoff("start", &Backoff::default(), cancel, || engine.start(id))
            .await
            .map_err(|err| err.context(format!("start {id}")))?;
        info!(resource = %self.id, "session started");

        if let Some(wait) = self.wait.clone() {
            wait.wait_until_ready(&*self, cancel)
                .await
                .map_err(|err| err.context(format!("{} readiness", self.id)))?;
            info!(resource = %self.id, "session ready");
        }

        self.state = SessionState::Running;
        Ok(())
    }

    /// Stop the container, killing it after `timeout` (engine default when `None`).
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` once terminated.
    /// - `AppError::Cancelled` when `cancel` fires.
    /// - The engine's error.
    pub async fn stop(&mut self, cancel: &CancellationToken, timeout: Option<Duration>) -> Result<()> {
        self.ensure_live("stop")?;

        cancellable(cancel, "stop", self.engine.stop(&self.id, timeout))
            .await
            .map_err(|err| err.context(format!("stop {}", self.id)))?;

        self.state = SessionState::Stopped;
        info!(resource = %self.id, "session stopped");
        Ok(())
    }

    /// Stop the log producer, remove the container together with its volumes,
    /// and tell the reaper it is gone.
    ///
    /// The reaper is only told once the removal succeeded, so a container that
    /// could not be removed is still swept with its group.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` if already terminated.
    /// - `AppError::Cancelled` when `cancel` fires.
    /// - The engine's error; a container that is already gone is not an error.
    pub async fn terminate(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live("terminate")?;

        if let Err(err) = self.stop_log_producer().await {
            warn!(%err, resource = %self.id, "log producer did not stop cleanly");
        }

        let engine = &self.engine;
        let id = &self.id;
        let removed = retry_with_backoff("remove", &Backoff::default(), cancel, || {
            engine.remove(id, RemoveOptions::forced())
        })
        .await;

        match removed {
            Ok(()) => {}
            Err(AppError::NotFound(_)) => debug!(resource = %self.id, "already removed"),
            Err(err) => return Err(err.context(format!("terminate {}", self.id))),
        }

        if let Some(signal) = &self.termination {
            signal.notify(&self.id);
        }

        self.state = SessionState::Terminated;
        info!(resource = %self.id, "session terminated");
        Ok(())
    }

    /// Register `consumer`; it sees frames decoded from now on.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` once terminated.
    pub fn follow_output(&self, consumer: Arc<dyn LogConsumer>) -> Result<()> {
        self.ensure_live("follow output")?;
        self.consumers.push(consumer);
        Ok(())
    }

    /// Start streaming logs to the registered consumers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` once terminated or while a producer runs.
    pub fn start_log_producer(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live("start log producer")?;

        if self.producer.as_ref().is_some_and(|p| !p.is_finished()) {
            return Err(AppError::InvalidState(format!(
                "log producer already running for {}",
                self.id
            )));
        }

        self.producer = Some(LogProducer::spawn(
            Arc::clone(&self.engine),
            self.id.clone(),
            self.consumers.clone(),
            self.logs_backoff,
            cancel.child_token(),
        ));
        debug!(resource = %self.id, consumers = self.consumers.len(), "log producer started");
        Ok(())
    }

    /// Stop the log producer and wait for it to close its stream.
    ///
    /// A no-op when no producer was started or it was already stopped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the producer task panicked.
    pub async fn stop_log_producer(&mut self) -> Result<()> {
        match self.producer.take() {
            Some(mut producer) => producer.stop().await,
            None => Ok(()),
        }
    }

    /// Host where mapped ports are reachable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` once terminated.
    pub fn host(&self) -> Result<String> {
        self.ensure_live("resolve host")?;
        Ok(self
            .host_override
            .clone()
            .unwrap_or_else(|| self.engine.daemon_host()))
    }

    /// Host port bound to `port`; identity under host networking.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` once terminated.
    /// - `AppError::Engine` while the port is not (yet) mapped.
    pub async fn mapped_port(&self, port: ExposedPort) -> Result<u16> {
        self.ensure_live("resolve mapped port")?;
        let state = self.engine.inspect(&self.id).await?;
        state
            .mapped_port(port)
            .ok_or_else(|| AppError::Engine(format!("port {port} of {} is not mapped", self.id)))
    }

    /// `host:port`, or `proto://host:port` when `proto` is given.
    ///
    /// # Errors
    ///
    /// As [`host`](Self::host) and [`mapped_port`](Self::mapped_port).
    pub async fn port_endpoint(&self, port: ExposedPort, proto: Option<&str>) -> Result<String> {
        let host = self.host()?;
        let host_port = self.mapped_port(port).await?;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        Ok(match proto {
            Some(proto) if !proto.is_empty() => format!("{proto}://{host}:{host_port}"),
            _ => format!("{host}:{host_port}"),
        })
    }

    /// Endpoint of the lowest exposed port.
    ///
    /// # Errors
    ///
    /// `AppError::InvalidState` when nothing is exposed, otherwise as
    /// [`port_endpoint`](Self::port_endpoint).
    pub async fn endpoint(&self, proto: Option<&str>) -> Result<String> {
        let port = self
            .exposed_ports
            .iter()
            .min()
            .copied()
            .ok_or_else(|| AppError::InvalidState(format!("{} exposes no ports", self.id)))?;
        self.port_endpoint(port, proto).await
    }

    /// Complete log output so far, in multiplexed form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` once terminated, or the engine's error.
    pub async fn logs(&self) -> Result<LogStream> {
        self.ensure_live("read logs")?;
        self.engine
            .stream_logs(
                &self.id,
                LogOptions {
                    follow: false,
                    since: None,
                },
            )
            .await
    }

    fn ensure_live(&self, operation: &str) -> Result<()> {
        if self.state == SessionState::Terminated {
            return Err(AppError::InvalidState(format!(
                "cannot {operation}: {} is terminated",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("exposed_ports", &self.exposed_ports)
            .field("consumers", &self.consumers.len())
            .finish_non_exhaustive()
    }
}

impl WaitTarget for Session {
    fn host(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(std::future::ready(Session::host(self)))
    }

    fn mapped_port(&self, port: ExposedPort) -> BoxFuture<'_, Result<u16>> {
        Box::pin(Session::mapped_port(self, port))
    }

    fn exposed_ports(&self) -> Vec<ExposedPort> {
        self.exposed_ports.clone()
    }

    fn logs(&self) -> BoxFuture<'_, Result<LogStream>> {
        Box::pin(Session::logs(self))
    }
}

/// Race `operation` against `cancel`.
async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AppError::Cancelled(format!("{what} cancelled"))),
        result = operation => result,
    }
}
