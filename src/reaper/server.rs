//! The reaper itself.
//!
//! Accepts control connections, tracks the label filters they watch, and
//! sweeps a filter once the last connection watching it is lost. A
//! connection is lost on EOF, on a read error, or when no request arrives
//! within the peer timeout; keep-alive pings keep a healthy client inside it.
//!
//! Filters are reference counted, so several clients of one session group
//! share a single sweep. A reconnection during the sweep grace period
//! cancels the pending sweep.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use super::protocol::{encode_line, ControlRequest, ControlResponse};
use crate::config::ReaperConfig;
use crate::engine::{Engine, Labels, RemoveOptions, ResourceId, ResourceKind};
use crate::retry::{retry_with_backoff, Backoff};
use crate::{AppError, Result};

/// Watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    /// Silence after which a connection is considered lost.
    pub peer_timeout: Duration,
    /// Delay between losing the last connection of a filter and sweeping it.
    pub sweep_grace: Duration,
    /// Exit if no connection arrives within this window.
    pub initial_connect_timeout: Duration,
    /// Exit once a sweep leaves no connection and no watched filter behind.
    pub exit_when_idle: bool,
    /// Retry policy for engine calls during a sweep.
    pub backoff: Backoff,
}

impl ReaperSettings {
    /// Settings derived from the `[reaper]` config table.
    #[must_use]
    pub fn from_config(config: &ReaperConfig) -> Self {
        Self {
            peer_timeout: config.peer_timeout(),
            sweep_grace: config.sweep_grace(),
            initial_connect_timeout: config.initial_connect_timeout(),
            exit_when_idle: true,
            backoff: Backoff::default(),
        }
    }
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self::from_config(&ReaperConfig::default())
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Filter that was swept.
    pub filter: Labels,
    /// Containers removed or already gone.
    pub containers: Vec<ResourceId>,
    /// Networks removed or already gone.
    pub networks: Vec<ResourceId>,
    /// Images removed or already gone.
    pub images: Vec<ResourceId>,
    /// Failures that survived retrying.
    pub errors: Vec<String>,
}

impl SweepReport {
    /// Total resources removed.
    #[must_use]
    pub fn removed(&self) -> usize {
        self.containers.len() + self.networks.len() + self.images.len()
    }

    fn record(&mut self, id: ResourceId) {
        match id.kind {
            ResourceKind::Container => self.containers.push(id),
            ResourceKind::Network => self.networks.push(id),
            ResourceKind::Image => self.images.push(id),
        }
    }
}

/// TCP watchdog server.
pub struct ReaperServer {
    listener: TcpListener,
    engine: Arc<dyn Engine>,
    settings: ReaperSettings,
    self_id: Option<ResourceId>,
    report_tx: Option<mpsc::Sender<SweepReport>>,
}

impl ReaperServer {
    /// Bind the control listener.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Reaper` if the address cannot be bound.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        engine: Arc<dyn Engine>,
        settings: ReaperSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| AppError::Reaper(format!("failed to bind control port: {err}")))?;

        Ok(Self {
            listener,
            engine,
            settings,
            self_id: None,
            report_tx: None,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The reaper's own resource: never swept, removed when the server exits idle.
    #[must_use]
    pub fn with_self_id(mut self, id: ResourceId) -> Self {
        self.self_id = Some(id);
        self
    }

    /// Send every [`SweepReport`] to `tx`.
    #[must_use]
    pub fn with_report_channel(mut self, tx: mpsc::Sender<SweepReport>) -> Self {
        self.report_tx = Some(tx);
        self
    }

    /// Accept connections until `cancel` fires or the server goes idle.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; the `Result` leaves room for
    /// listener failures that should stop the server.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let Self {
            listener,
            engine,
            settings,
            self_id,
            report_tx,
        } = self;
        let shutdown = cancel.child_token();
        let shared = Arc::new(Shared {
            engine,
            settings,
            self_id,
            report_tx,
            state: Mutex::new(WatchState::default()),
            tracker: TaskTracker::new(),
            cancel: cancel.clone(),
            shutdown: shutdown.clone(),
        });

        info!(%addr, "reaper listening");

        let first_connection = sleep(shared.settings.initial_connect_timeout);
        tokio::pin!(first_connection);
        let mut connected = false;

        let exit = async {
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break Exit::Cancelled,

                    () = shutdown.cancelled() => break Exit::Idle,

                    () = &mut first_connection, if !connected => break Exit::NoConnection,

                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            connected = true;
                            let span = info_span!("reaper_conn", %peer);
                            shared
                                .tracker
                                .spawn(handle_connection(stream, Arc::clone(&shared)).instrument(span));
                        }
                        Err(err) => warn!(%err, "reaper accept failed"),
                    },
                }
            }
        }
        .instrument(info_span!("reaper_server", %addr))
        .await;

        match exit {
            Exit::Cancelled => info!("reaper shutting down"),
            Exit::Idle => info!("no connections left after sweep; reaper exiting"),
            Exit::NoConnection => warn!(
                timeout_secs = shared.settings.initial_connect_timeout.as_secs(),
                "no control connection arrived; reaper exiting"
            ),
        }

        shutdown.cancel();
        shared.tracker.close();
        shared.tracker.wait().await;

        if exit != Exit::Cancelled {
            shared.remove_self().await;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    Idle,
    NoConnection,
}

#[derive(Debug, Default)]
struct FilterEntry {
    connections: usize,
    /// Bumped on every watch so a pending sweep can tell it was superseded.
    generation: u64,
}

#[derive(Debug, Default)]
struct WatchState {
    filters: HashMap<Labels, FilterEntry>,
    released: HashSet<ResourceId>,
    connections: usize,
}

struct Shared {
    engine: Arc<dyn Engine>,
    settings: ReaperSettings,
    self_id: Option<ResourceId>,
    report_tx: Option<mpsc::Sender<SweepReport>>,
    state: Mutex<WatchState>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, request: ControlRequest, watched: &mut Vec<Labels>) -> ControlResponse {
        match request {
            ControlRequest::Watch { labels } => {
                if labels.is_empty() {
                    return ControlResponse::error("refusing to watch an empty label filter");
                }
                if watched.contains(&labels) {
                    return ControlResponse::success();
                }
                let mut state = self.lock();
                let entry = state.filters.entry(labels.clone()).or_default();
                entry.connections += 1;
                entry.generation += 1;
                info!(filter = ?labels, connections = entry.connections, "watching filter");
                watched.push(labels);
                ControlResponse::success()
            }
            ControlRequest::Release { id } => {
                debug!(resource = %id, "resource released by owner");
                self.lock().released.insert(id);
                ControlResponse::success()
            }
            ControlRequest::Ping => ControlResponse::success(),
        }
    }

    fn connection_opened(&self) {
        self.lock().connections += 1;
    }

    /// Drop the connection's references; returns filters that must now be swept.
    fn connection_lost(&self, watched: Vec<Labels>) -> Vec<(Labels, u64)> {
        let mut state = self.lock();
        state.connections = state.connections.saturating_sub(1);

        let mut orphaned = Vec::new();
        for labels in watched {
            if let Some(entry) = state.filters.get_mut(&labels) {
                entry.connections = entry.connections.saturating_sub(1);
                if entry.connections == 0 {
                    orphaned.push((labels, entry.generation));
                }
            }
        }
        orphaned
    }

    fn connection_closed_on_shutdown(&self) {
        let mut state = self.lock();
        state.connections = state.connections.saturating_sub(1);
    }

    /// Take ownership of a sweep unless a watch arrived since it was scheduled.
    fn claim_sweep(&self, labels: &Labels, generation: u64) -> bool {
        let mut state = self.lock();
        let claimable = state
            .filters
            .get(labels)
            .is_some_and(|entry| entry.connections == 0 && entry.generation == generation);
        if claimable {
            state.filters.remove(labels);
        }
        claimable
    }

    /// Whether the sweep must leave `id` alone. A release is consumed by the
    /// first sweep that skips it.
    fn take_skip(&self, id: &ResourceId) -> bool {
        self.self_id.as_ref() == Some(id) || self.lock().released.remove(id)
    }

    /// Forget every release once no filter is left that could still match it.
    fn prune_released(&self) {
        let mut state = self.lock();
        if state.filters.is_empty() {
            state.released.clear();
        }
    }

    fn exit_if_idle(&self) {
        if !self.settings.exit_when_idle {
            return;
        }
        let state = self.lock();
        if state.connections == 0 && state.filters.is_empty() {
            self.shutdown.cancel();
        }
    }

    async fn remove_self(&self) {
        let Some(id) = &self.self_id else {
            return;
        };
        match self.engine.remove(id, RemoveOptions::forced()).await {
            Ok(()) | Err(AppError::NotFound(_)) => info!(resource = %id, "reaper removed itself"),
            Err(err) => warn!(%err, resource = %id, "reaper failed to remove itself"),
        }
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    shared.connection_opened();

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut watched: Vec<Labels> = Vec::new();
    let peer_timeout = shared.settings.peer_timeout;

    let lost = loop {
        line.clear();
        let read = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break false,
            read = tokio::time::timeout(peer_timeout, reader.read_line(&mut line)) => read,
        };

        match read {
            Err(_) => {
                warn!(timeout_secs = peer_timeout.as_secs(), "peer silent past timeout");
                break true;
            }
            Ok(Ok(0)) => {
                debug!("peer closed control connection");
                break true;
            }
            Ok(Err(err)) => {
                warn!(%err, "control connection read error");
                break true;
            }
            Ok(Ok(_)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<ControlRequest>(trimmed) {
                    Ok(request) => shared.dispatch(request, &mut watched),
                    Err(err) => ControlResponse::error(format!("invalid request: {err}")),
                };

                let response_line = encode_line(&response).unwrap_or_else(|_| {
                    "{\"ok\":false,\"error\":\"serialization failed\"}\n".to_owned()
                });

                if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                    warn!(%err, "failed to write control response");
                    break true;
                }
            }
        }
    };

    if !lost {
        shared.connection_closed_on_shutdown();
        return;
    }

    for (labels, generation) in shared.connection_lost(watched) {
        schedule_sweep(&shared, labels, generation);
    }
}

fn schedule_sweep(shared: &Arc<Shared>, labels: Labels, generation: u64) {
    let span = info_span!("reaper_sweep", filter = ?labels);
    let task_shared = Arc::clone(shared);

    shared.tracker.spawn(
        async move {
            let shared = task_shared;
            let grace = shared.settings.sweep_grace;
            if !grace.is_zero() {
                debug!(grace_secs = grace.as_secs(), "sweep pending");
                tokio::select! {
                    () = shared.cancel.cancelled() => return,
                    () = sleep(grace) => {}
                }
            }

            if !shared.claim_sweep(&labels, generation) {
                info!("filter watched again during grace period; sweep cancelled");
                return;
            }

            let report = sweep(&shared, labels).await;
            shared.prune_released();
            info!(
                containers = report.containers.len(),
                networks = report.networks.len(),
                images = report.images.len(),
                errors = report.errors.len(),
                "sweep finished"
            );

            if let Some(tx) = &shared.report_tx {
                if tx.send(report).await.is_err() {
                    debug!("sweep report receiver dropped");
                }
            }

            shared.exit_if_idle();
        }
        .instrument(span),
    );
}

/// Remove every container, then network, then image matching `filter`.
async fn sweep(shared: &Shared, filter: Labels) -> SweepReport {
    let engine = &shared.engine;
    let backoff = &shared.settings.backoff;
    let mut report = SweepReport::default();

    for kind in [
        ResourceKind::Container,
        ResourceKind::Network,
        ResourceKind::Image,
    ] {
        let listed = retry_with_backoff("list", backoff, &shared.cancel, || {
            engine.list(kind, &filter)
        })
        .await;

        let ids = match listed {
            Ok(ids) => ids,
            Err(err) => {
                report
                    .errors
                    .push(format!("list {}s: {err}", kind.as_str()));
                continue;
            }
        };

        for id in ids {
            if shared.take_skip(&id) {
                debug!(resource = %id, "skipping");
                continue;
            }

            let removed = retry_with_backoff("remove", backoff, &shared.cancel, || {
                engine.remove(&id, RemoveOptions::forced())
            })
            .await;

            match removed {
                Ok(()) => {
                    info!(resource = %id, "removed");
                    report.record(id);
                }
                Err(AppError::NotFound(_)) => {
                    debug!(resource = %id, "already removed");
                    report.record(id);
                }
                Err(err) => {
                    warn!(%err, resource = %id, "failed to remove");
                    report.errors.push(format!("remove {id}: {err}"));
                }
            }
        }
    }

    report.filter = filter;
    report
}
