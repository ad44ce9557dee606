//! Crash-safe cleanup.
//!
//! Every resource a provider creates carries the session-group label. A
//! reaper resource watches that label over a control connection held open by
//! [`client::ReaperHandle`]; once the connection is lost (normal shutdown,
//! crash, or silence past the peer timeout) [`server::ReaperServer`] removes
//! every labeled container, network and image.

pub mod client;
pub mod protocol;
pub mod server;

use uuid::Uuid;

pub use client::{ReaperHandle, ReaperRegistry, TerminationSignal};
pub use protocol::{ControlRequest, ControlResponse};
pub use server::{ReaperServer, ReaperSettings, SweepReport};

use crate::engine::Labels;

/// Label present on every resource this crate creates.
pub const LABEL_MANAGED_BY: &str = "io.berth.managed-by";

/// Value of [`LABEL_MANAGED_BY`].
pub const MANAGED_BY_VALUE: &str = "berth";

/// Label carrying the session-group identifier.
pub const LABEL_SESSION_GROUP: &str = "io.berth.session-group";

/// Label marking the reaper resource itself.
pub const LABEL_REAPER: &str = "io.berth.reaper";

/// Environment variable telling the reaper which port to listen on.
pub const ENV_REAPER_PORT: &str = "BERTH_REAPER_PORT";

/// Environment variable telling the reaper which session group it serves.
pub const ENV_REAPER_SESSION_GROUP: &str = "BERTH_REAPER_SESSION_GROUP";

/// Labels applied to resources that skip reaping.
#[must_use]
pub fn managed_labels() -> Labels {
    Labels::from([(LABEL_MANAGED_BY.to_owned(), MANAGED_BY_VALUE.to_owned())])
}

/// Labels applied to every reaped resource of `group`, and the reaper's watch filter.
#[must_use]
pub fn group_labels(group: Uuid) -> Labels {
    let mut labels = managed_labels();
    labels.insert(LABEL_SESSION_GROUP.to_owned(), group.to_string());
    labels
}

/// Labels of the reaper resource serving `group`.
///
/// They deliberately omit [`LABEL_MANAGED_BY`] so the reaper never matches
/// its own watch filter.
#[must_use]
pub fn reaper_labels(group: Uuid) -> Labels {
    Labels::from([
        (LABEL_REAPER.to_owned(), "true".to_owned()),
        (LABEL_SESSION_GROUP.to_owned(), group.to_string()),
    ])
}
