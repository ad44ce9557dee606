//! Networks created through a provider.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{Engine, Labels, RemoveOptions, ResourceId};
use crate::reaper::TerminationSignal;
use crate::retry::{retry_with_backoff, Backoff};
use crate::{AppError, Result};

/// What network to create.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub(super) name: String,
    pub(super) labels: Labels,
    pub(super) skip_reaper: bool,
}

impl NetworkSpec {
    /// A network named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            skip_reaper: false,
        }
    }

    /// Add a label. Caller labels are never overwritten by the crate's own.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Leave this network out of reaping.
    #[must_use]
    pub fn with_skip_reaper(mut self) -> Self {
        self.skip_reaper = true;
        self
    }
}

/// A network resource.
pub struct Network {
    id: ResourceId,
    name: String,
    engine: Arc<dyn Engine>,
    termination: Option<TerminationSignal>,
    removed: bool,
}

impl Network {
    pub(super) fn new(
        id: ResourceId,
        name: String,
        engine: Arc<dyn Engine>,
        termination: Option<TerminationSignal>,
    ) -> Self {
        Self {
            id,
            name,
            engine,
            termination,
            removed: false,
        }
    }

    /// Engine handle.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the network, then tell the reaper it is gone.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` if already removed.
    /// - `AppError::Cancelled` when `cancel` fires.
    /// - The engine's error; a network that is already gone is not an error.
    pub async fn remove(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.removed {
            return Err(AppError::InvalidState(format!(
                "network {} already removed",
                self.name
            )));
        }

        let engine = &self.engine;
        let id = &self.id;
        match retry_with_backoff("remove", &Backoff::default(), cancel, || {
            engine.remove(id, RemoveOptions::default())
        })
        .await
        {
            Ok(()) => info!(network = %self.name, "network removed"),
            Err(AppError::NotFound(_)) => debug!(network = %self.name, "network already removed"),
            Err(err) => return Err(err.context(format!("remove network {}", self.name))),
        }

        if let Some(signal) = &self.termination {
            signal.notify(&self.id);
        }

        self.removed = true;
        Ok(())
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("removed", &self.removed)
            .finish_non_exhaustive()
    }
}
