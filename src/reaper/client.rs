//! Client side of the reaper: provisioning and the control connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::protocol::{encode_line, ControlRequest, ControlResponse};
use super::{group_labels, reaper_labels, ENV_REAPER_PORT, ENV_REAPER_SESSION_GROUP};
use crate::config::{BerthConfig, ReaperConfig};
use crate::engine::{
    pull_image, Engine, ExposedPort, Labels, ResourceId, ResourceKind, ResourceSpec,
};
use crate::{AppError, Result};

/// Queued release notifications before `notify` starts dropping them.
const RELEASE_QUEUE: usize = 256;

/// Cap for the delay between dial attempts while the reaper boots.
const MAX_DIAL_DELAY: Duration = Duration::from_secs(1);

/// Provisions reapers and hands out one live [`ReaperHandle`] per session group.
pub struct ReaperRegistry {
    engine: Arc<dyn Engine>,
    config: ReaperConfig,
    host: Option<String>,
    /// Held across provisioning so concurrent connects for one group provision once.
    handles: Mutex<HashMap<Uuid, ReaperHandle>>,
}

impl ReaperRegistry {
    /// Registry using `config`'s `[reaper]` table and host override.
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>, config: &BerthConfig) -> Self {
        Self {
            engine,
            config: config.reaper.clone(),
            host: config.host.clone(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Live handle for `group`, provisioning a reaper on first use or after
    /// the previous connection died.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Reaper` if the reaper cannot be provisioned,
    /// reached, or refuses the watch request.
    pub async fn connect(&self, group: Uuid) -> Result<ReaperHandle> {
        let mut handles = self.handles.lock().await;

        if let Some(handle) = handles.get(&group) {
            if handle.is_connected() {
                return Ok(handle.clone());
            }
            info!(session_group = %group, "reaper connection lost; reprovisioning");
        }

        let handle = self
            .provision(group)
            .instrument(info_span!("reaper_provision", session_group = %group))
            .await
            .map_err(into_reaper_error)?;
        handles.insert(group, handle.clone());
        Ok(handle)
    }

    /// Close every control connection, triggering the sweeps.
    pub async fn disconnect_all(&self) {
        let handles: Vec<ReaperHandle> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.disconnect().await;
        }
    }

    async fn provision(&self, group: Uuid) -> Result<ReaperHandle> {
        let port = self.locate_or_start(group).await?;
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| self.engine.daemon_host());

        let stream = self.dial(&host, port).await?;
        info!(%host, port, "reaper control connection established");
        ReaperHandle::open(stream, group, &self.config).await
    }

    /// Reuse a running reaper for `group` or start a new one; returns its mapped control port.
    async fn locate_or_start(&self, group: Uuid) -> Result<u16> {
        let labels = reaper_labels(group);
        let control = ExposedPort::tcp(self.config.control_port);

        for id in self.engine.list(ResourceKind::Container, &labels).await? {
            match self.engine.inspect(&id).await {
                Ok(state) if state.running => {
                    if let Some(port) = state.mapped_port(control) {
                        info!(resource = %id, "reusing running reaper");
                        return Ok(port);
                    }
                }
                Ok(_) => debug!(resource = %id, "ignoring stopped reaper"),
                Err(err) => debug!(%err, resource = %id, "ignoring uninspectable reaper"),
            }
        }

        pull_image(self.engine.as_ref(), &self.config.image).await?;

        let mut spec = ResourceSpec::container(self.config.image.clone());
        spec.name = Some(format!("berth-reaper-{group}"));
        spec.exposed_ports.push(control);
        spec.env
            .insert(ENV_REAPER_PORT.to_owned(), self.config.control_port.to_string());
        spec.env
            .insert(ENV_REAPER_SESSION_GROUP.to_owned(), group.to_string());

        let id = self.engine.create(&spec, &labels).await?;
        self.engine.start(&id).await?;
        info!(resource = %id, image = %self.config.image, "reaper started");

        self.engine
            .inspect(&id)
            .await?
            .mapped_port(control)
            .ok_or_else(|| AppError::Reaper(format!("control port {control} is not mapped")))
    }

    /// Dial until the reaper accepts or `connect_timeout` passes.
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let timeout = self.config.connect_timeout();
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(50);

        loop {
            match TcpStream::connect((host, port)).await {
                Ok(stream) => return Ok(stream),
                Err(err) if Instant::now() + delay < deadline => {
                    debug!(%err, delay_ms = delay.as_millis(), "reaper not accepting yet");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_DIAL_DELAY);
                }
                Err(err) => {
                    return Err(AppError::Reaper(format!(
                        "cannot reach reaper at {host}:{port} within {}s: {err}",
                        timeout.as_secs()
                    )));
                }
            }
        }
    }
}

impl std::fmt::Debug for ReaperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaperRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn into_reaper_error(err: AppError) -> AppError {
    match err {
        AppError::Reaper(_) => err,
        other => AppError::Reaper(other.to_string()),
    }
}

/// A session group's open control connection.
///
/// Cheap to clone; every clone refers to the same connection. The connection
/// closes when [`disconnect`](Self::disconnect) is called or the last clone
/// is dropped.
#[derive(Debug, Clone)]
pub struct ReaperHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    group: Uuid,
    labels: Labels,
    tx: mpsc::Sender<ControlRequest>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ReaperHandle {
    /// Send the watch request over `stream` and hand the connection to a background task.
    async fn open(stream: TcpStream, group: Uuid, config: &ReaperConfig) -> Result<Self> {
        let labels = group_labels(group);
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        write_request(
            &mut writer,
            &ControlRequest::Watch {
                labels: labels.clone(),
            },
        )
        .await?;

        let ack = tokio::time::timeout(config.connect_timeout(), lines.next_line())
            .await
            .map_err(|_| AppError::Reaper("reaper did not acknowledge watch request".into()))?
            .map_err(|err| AppError::Reaper(format!("failed to read watch acknowledgement: {err}")))?
            .ok_or_else(|| AppError::Reaper("reaper closed connection before acknowledging".into()))?;

        let response: ControlResponse = serde_json::from_str(ack.trim())?;
        if !response.ok {
            return Err(AppError::Reaper(format!(
                "watch rejected: {}",
                response.error.unwrap_or_default()
            )));
        }

        let (tx, rx) = mpsc::channel(RELEASE_QUEUE);
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            run_control(
                writer,
                lines,
                rx,
                cancel.clone(),
                config.keepalive_interval(),
                Arc::clone(&connected),
            )
            .instrument(info_span!("reaper_control", session_group = %group)),
        );

        Ok(Self {
            inner: Arc::new(HandleInner {
                group,
                labels,
                tx,
                connected,
                cancel,
                task: StdMutex::new(Some(task)),
            }),
        })
    }

    /// Session group this handle watches.
    #[must_use]
    pub fn session_group(&self) -> Uuid {
        self.inner.group
    }

    /// Labels to merge into every resource of the group.
    #[must_use]
    pub fn labels(&self) -> Labels {
        self.inner.labels.clone()
    }

    /// Channel for telling the reaper a resource was removed by its owner.
    #[must_use]
    pub fn termination_signal(&self) -> TerminationSignal {
        TerminationSignal {
            tx: self.inner.tx.clone(),
        }
    }

    /// Whether the control connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }

    /// Close the control connection; the reaper then sweeps the group.
    ///
    /// Calling this more than once is a no-op.
    pub async fn disconnect(&self) {
        self.inner.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "reaper control task failed");
            }
        }
    }
}

/// Non-blocking notification that a resource is gone.
#[derive(Debug, Clone)]
pub struct TerminationSignal {
    tx: mpsc::Sender<ControlRequest>,
}

impl TerminationSignal {
    /// Tell the reaper `id` was removed; never blocks.
    pub fn notify(&self, id: &ResourceId) {
        let request = ControlRequest::Release { id: id.clone() };
        if let Err(err) = self.tx.try_send(request) {
            debug!(%err, resource = %id, "release notification dropped");
        }
    }
}

async fn write_request(writer: &mut OwnedWriteHalf, request: &ControlRequest) -> Result<()> {
    let line = encode_line(request)?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|err| AppError::Reaper(format!("failed to write control request: {err}")))
}

/// Own the connection: keep-alives, releases, and response draining.
async fn run_control(
    mut writer: OwnedWriteHalf,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut rx: mpsc::Receiver<ControlRequest>,
    cancel: CancellationToken,
    keepalive: Duration,
    connected: Arc<AtomicBool>,
) {
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);

    loop {
        let request = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("closing reaper control connection");
                break;
            }

            Some(request) = rx.recv() => request,

            _ = ticker.tick() => ControlRequest::Ping,

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        match serde_json::from_str::<ControlResponse>(line.trim()) {
                            Ok(response) if !response.ok => warn!(
                                error = response.error.as_deref().unwrap_or(""),
                                "reaper rejected request"
                            ),
                            Ok(_) => {}
                            Err(err) => warn!(%err, "malformed reaper response"),
                        }
                        continue;
                    }
                    Ok(None) => {
                        warn!("reaper closed control connection");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "reaper control connection read error");
                        break;
                    }
                }
            }
        };

        if let Err(err) = write_request(&mut writer, &request).await {
            warn!(%err, "reaper control connection write failed");
            break;
        }
    }

    connected.store(false, Ordering::SeqCst);
    if let Err(err) = writer.shutdown().await {
        debug!(%err, "control connection shutdown failed");
    }
}
