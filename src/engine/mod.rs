//! Container-engine abstraction.
//!
//! The [`Engine`] trait is the only seam between this crate and a concrete
//! container engine. It deliberately covers the minimum the session
//! lifecycle, readiness checks, log pipeline and reaper sweep need: handles,
//! a state snapshot and a raw multiplexed log byte stream. Request
//! translation into engine-native structures is left to implementors.

pub mod ports;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use ports::{ExposedPort, PortBinding, Protocol};

use crate::retry::{retry_with_backoff, Backoff};
use crate::{AppError, Result};

/// Resource labels; ordered so filters and requests are deterministic.
pub type Labels = BTreeMap<String, String>;

/// Boxed future returned by every [`Engine`] operation.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Raw combined stdout/stderr log stream in the engine's multiplexed format.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

/// Kind of engine-managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A container.
    Container,
    /// A network.
    Network,
    /// A (built) image.
    Image,
}

impl ResourceKind {
    /// Lowercase kind name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Network => "network",
            Self::Image => "image",
        }
    }
}

/// Opaque engine handle for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Engine-assigned identifier.
    pub id: String,
}

impl ResourceId {
    /// Handle for a container.
    #[must_use]
    pub fn container(id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Container,
            id: id.into(),
        }
    }

    /// Handle for a network.
    #[must_use]
    pub fn network(id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Network,
            id: id.into(),
        }
    }

    /// Handle for an image.
    #[must_use]
    pub fn image(id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Image,
            id: id.into(),
        }
    }

    /// First 12 characters of the identifier, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.short())
    }
}

/// What to create. Engines map this onto their native request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Kind of resource to create.
    pub kind: ResourceKind,
    /// Image reference (containers only).
    pub image: Option<String>,
    /// Optional resource name.
    pub name: Option<String>,
    /// Ports to expose and publish on random host ports.
    pub exposed_ports: Vec<ExposedPort>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Command override.
    pub cmd: Vec<String>,
}

impl ResourceSpec {
    /// A container spec for `image`.
    #[must_use]
    pub fn container(image: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Container,
            image: Some(image.into()),
            name: None,
            exposed_ports: Vec::new(),
            env: BTreeMap::new(),
            cmd: Vec::new(),
        }
    }

    /// A network spec named `name`.
    #[must_use]
    pub fn network(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Network,
            image: None,
            name: Some(name.into()),
            exposed_ports: Vec::new(),
            env: BTreeMap::new(),
            cmd: Vec::new(),
        }
    }
}

/// Options for [`Engine::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveOptions {
    /// Also remove anonymous volumes.
    pub remove_volumes: bool,
    /// Kill a running resource instead of failing.
    pub force: bool,
}

impl RemoveOptions {
    /// `remove_volumes` and `force` both set; used by terminate and the reaper sweep.
    #[must_use]
    pub fn forced() -> Self {
        Self {
            remove_volumes: true,
            force: true,
        }
    }
}

/// Snapshot returned by [`Engine::inspect`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceState {
    /// Whether the resource is running.
    pub running: bool,
    /// Network mode; `host` means ports are not remapped.
    pub network_mode: Option<String>,
    /// Published ports and their host bindings.
    pub ports: BTreeMap<ExposedPort, Vec<PortBinding>>,
}

impl ResourceState {
    /// Host port for an internal port, honoring host networking.
    ///
    /// Matches on port number and, when the protocols differ, skips the entry.
    #[must_use]
    pub fn mapped_port(&self, port: ExposedPort) -> Option<u16> {
        if self.network_mode.as_deref() == Some("host") {
            return Some(port.port);
        }

        self.ports
            .iter()
            .filter(|(exposed, _)| exposed.port == port.port && exposed.protocol == port.protocol)
            .find_map(|(_, bindings)| bindings.first().map(|b| b.host_port))
    }
}

/// Timestamp with second and nanosecond precision, used as the `since`
/// parameter when re-requesting logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogSince {
    /// Seconds since the Unix epoch.
    pub secs: i64,
    /// Sub-second nanoseconds, `0..1_000_000_000`.
    pub nanos: u32,
}

impl LogSince {
    /// The current instant.
    #[must_use]
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// Convert back into a UTC timestamp.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.secs, self.nanos)
    }
}

impl From<DateTime<Utc>> for LogSince {
    fn from(at: DateTime<Utc>) -> Self {
        Self {
            secs: at.timestamp(),
            nanos: at.timestamp_subsec_nanos(),
        }
    }
}

impl Display for LogSince {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

impl FromStr for LogSince {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = |why: &str| AppError::Config(format!("invalid since '{raw}': {why}"));
        let (secs, nanos) = raw.split_once('.').unwrap_or((raw, "0"));
        let secs: i64 = secs.parse().map_err(|_| invalid("seconds"))?;
        if nanos.is_empty() || nanos.len() > 9 || !nanos.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("nanoseconds"));
        }
        // Right-pad so "5" means 500ms, like any decimal fraction.
        let nanos: u32 = format!("{nanos:0<9}")
            .parse()
            .map_err(|_| invalid("nanoseconds"))?;
        Ok(Self { secs, nanos })
    }
}

/// Options for [`Engine::stream_logs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogOptions {
    /// Keep the stream open and deliver new output as it is produced.
    pub follow: bool,
    /// Only output produced strictly after this instant.
    pub since: Option<LogSince>,
}

/// External container-engine collaborator.
///
/// Implementations map their native errors onto [`AppError::NotFound`] for
/// missing resources and [`AppError::Engine`] for everything transient, so the
/// retry policy in [`crate::retry`] can tell them apart.
pub trait Engine: Send + Sync {
    /// Make `image` available to the engine, fetching it when missing.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no registry knows `image` and
    /// [`AppError::Engine`] for failures worth retrying.
    fn pull<'a>(&'a self, image: &'a str) -> EngineFuture<'a, ()>;

    /// Create a resource carrying `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`] or [`AppError::NotFound`] (missing image).
    fn create<'a>(
        &'a self,
        spec: &'a ResourceSpec,
        labels: &'a Labels,
    ) -> EngineFuture<'a, ResourceId>;

    /// Start a created resource.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if `id` is unknown.
    fn start<'a>(&'a self, id: &'a ResourceId) -> EngineFuture<'a, ()>;

    /// Stop a running resource, killing it after `timeout` (engine default when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if `id` is unknown.
    fn stop<'a>(&'a self, id: &'a ResourceId, timeout: Option<Duration>)
        -> EngineFuture<'a, ()>;

    /// Remove a resource.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if `id` is unknown.
    fn remove<'a>(&'a self, id: &'a ResourceId, options: RemoveOptions) -> EngineFuture<'a, ()>;

    /// Snapshot the resource's state.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if `id` is unknown.
    fn inspect<'a>(&'a self, id: &'a ResourceId) -> EngineFuture<'a, ResourceState>;

    /// Open the raw multiplexed log stream.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if `id` is unknown.
    fn stream_logs<'a>(&'a self, id: &'a ResourceId, options: LogOptions)
        -> EngineFuture<'a, LogStream>;

    /// List resources of `kind` carrying every label in `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`] on engine failure.
    fn list<'a>(&'a self, kind: ResourceKind, labels: &'a Labels)
        -> EngineFuture<'a, Vec<ResourceId>>;

    /// Host (name or IP) where published ports are reachable.
    fn daemon_host(&self) -> String;
}

/// Pull `image`, retrying transient failures; a missing image fails at once.
///
/// # Errors
///
/// Returns [`AppError::NotFound`] for unknown images and the last engine
/// error once attempts run out, both prefixed with the image name.
pub async fn pull_image(engine: &dyn Engine, image: &str) -> Result<()> {
    retry_with_backoff("pull", &Backoff::default(), &CancellationToken::new(), || {
        engine.pull(image)
    })
    .await
    .map_err(|err| err.context(format!("pull {image}")))?;

    debug!(image, "image available");
    Ok(())
}
