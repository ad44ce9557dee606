//! Provider, session and network lifecycle.
//!
//! A [`Provider`] owns the engine, the configuration, the reaper registry
//! and one session-group identifier. Every resource it creates is labeled
//! for that group, and the group's reaper connection is opened before the
//! first resource exists.

mod container;
mod network;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub use container::{Session, SessionState};
pub use network::{Network, NetworkSpec};

use crate::config::BerthConfig;
use crate::engine::{pull_image, Engine, ExposedPort, Labels, ResourceSpec};
use crate::reaper::{managed_labels, ReaperRegistry, TerminationSignal};
use crate::wait::WaitStrategy;
use crate::Result;

/// What to run in a new session.
#[derive(Clone)]
pub struct SessionSpec {
    image: String,
    name: Option<String>,
    exposed_ports: Vec<ExposedPort>,
    env: BTreeMap<String, String>,
    cmd: Vec<String>,
    labels: Labels,
    wait: Option<Arc<dyn WaitStrategy>>,
    skip_reaper: bool,
}

impl SessionSpec {
    /// A session running `image`.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            exposed_ports: Vec::new(),
            env: BTreeMap::new(),
            cmd: Vec::new(),
            labels: Labels::new(),
            wait: None,
            skip_reaper: false,
        }
    }

    /// Resource name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Expose and publish `port`.
    #[must_use]
    pub fn with_exposed_port(mut self, port: ExposedPort) -> Self {
        if !self.exposed_ports.contains(&port) {
            self.exposed_ports.push(port);
        }
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the command.
    #[must_use]
    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Add a label. Caller labels are never overwritten by the crate's own.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Block [`Session::start`] on `strategy`.
    #[must_use]
    pub fn waiting_for(mut self, strategy: impl WaitStrategy + 'static) -> Self {
        self.wait = Some(Arc::new(strategy));
        self
    }

    /// Leave this resource out of reaping; only an explicit terminate removes it.
    #[must_use]
    pub fn with_skip_reaper(mut self) -> Self {
        self.skip_reaper = true;
        self
    }

    fn resource_spec(&self) -> ResourceSpec {
        let mut spec = ResourceSpec::container(self.image.clone());
        spec.name.clone_from(&self.name);
        spec.exposed_ports.clone_from(&self.exposed_ports);
        spec.env.clone_from(&self.env);
        spec.cmd.clone_from(&self.cmd);
        spec
    }
}

impl fmt::Debug for SessionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSpec")
            .field("image", &self.image)
            .field("name", &self.name)
            .field("exposed_ports", &self.exposed_ports)
            .field("labels", &self.labels)
            .field("has_wait", &self.wait.is_some())
            .field("skip_reaper", &self.skip_reaper)
            .finish_non_exhaustive()
    }
}

/// Application context for creating sessions and networks.
pub struct Provider {
    engine: Arc<dyn Engine>,
    config: BerthConfig,
    registry: Arc<ReaperRegistry>,
    session_group: Uuid,
}

impl Provider {
    /// Provider with a fresh session group and its own reaper registry.
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>, config: BerthConfig) -> Self {
        let registry = Arc::new(ReaperRegistry::new(Arc::clone(&engine), &config));
        Self::with_registry(engine, config, registry, Uuid::new_v4())
    }

    /// Provider sharing `registry` and joining `session_group`.
    #[must_use]
    pub fn with_registry(
        engine: Arc<dyn Engine>,
        config: BerthConfig,
        registry: Arc<ReaperRegistry>,
        session_group: Uuid,
    ) -> Self {
        Self {
            engine,
            config,
            registry,
            session_group,
        }
    }

    /// Identifier labeling every reaped resource of this provider.
    #[must_use]
    pub fn session_group(&self) -> Uuid {
        self.session_group
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &BerthConfig {
        &self.config
    }

    /// Reaper registry used for this provider's connections.
    #[must_use]
    pub fn registry(&self) -> &Arc<ReaperRegistry> {
        &self.registry
    }

    /// Create (but do not start) a session.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the image does not exist.
    /// - `AppError::Reaper` if reaping is enabled and the reaper is unreachable.
    /// - The engine's error if pulling or creation fails.
    pub async fn create_session(&self, spec: SessionSpec) -> Result<Session> {
        let span = info_span!("create_session", image = %spec.image, session_group = %self.session_group);

        async move {
            pull_image(self.engine.as_ref(), &spec.image).await?;
            let (labels, termination) = self.resource_labels(&spec.labels, spec.skip_reaper).await?;
            let resource = spec.resource_spec();
            let id = self
                .engine
                .create(&resource, &labels)
                .await
                .map_err(|err| err.context(format!("create session from {}", spec.image)))?;

            info!(resource = %id, "session created");

            Ok(Session::new(
                id,
                Arc::clone(&self.engine),
                &self.config,
                labels,
                spec.exposed_ports,
                spec.wait,
                termination,
            ))
        }
        .instrument(span)
        .await
    }

    /// Create a network.
    ///
    /// # Errors
    ///
    /// - `AppError::Reaper` if reaping is enabled and the reaper is unreachable.
    /// - The engine's error if creation fails.
    pub async fn create_network(&self, spec: NetworkSpec) -> Result<Network> {
        let (labels, termination) = self
            .resource_labels(&spec.labels, spec.skip_reaper)
            .await?;
        let resource = ResourceSpec::network(spec.name.clone());
        let id = self
            .engine
            .create(&resource, &labels)
            .await
            .map_err(|err| err.context(format!("create network {}", spec.name)))?;

        info!(resource = %id, session_group = %self.session_group, "network created");
        Ok(Network::new(id, spec.name, Arc::clone(&self.engine), termination))
    }

    /// Caller labels plus the crate's own, never overriding caller keys.
    async fn resource_labels(
        &self,
        requested: &Labels,
        skip_reaper: bool,
    ) -> Result<(Labels, Option<TerminationSignal>)> {
        let (own, termination) = if skip_reaper || self.config.reaper.disabled {
            (managed_labels(), None)
        } else {
            let handle = self.registry.connect(self.session_group).await?;
            (handle.labels(), Some(handle.termination_signal()))
        };

        let mut labels = requested.clone();
        for (key, value) in own {
            labels.entry(key).or_insert(value);
        }
        Ok((labels, termination))
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("session_group", &self.session_group)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

