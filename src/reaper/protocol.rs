//! Reaper control protocol.
//!
//! Newline-delimited JSON over TCP. Requests:
//!
//! ```json
//! {"command": "watch", "labels": {"io.berth.session-group": "…"}}
//! {"command": "release", "id": {"kind": "container", "id": "…"}}
//! {"command": "ping"}
//! ```
//!
//! Responses:
//!
//! ```json
//! {"ok": true}
//! {"ok": false, "error": "invalid request: …"}
//! ```

use serde::{Deserialize, Serialize};

use crate::engine::{Labels, ResourceId};
use crate::Result;

/// Client-to-reaper message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Remove everything carrying `labels` once this connection is lost.
    Watch {
        /// Label filter; a resource matches when it carries all of them.
        labels: Labels,
    },
    /// The owner removed `id` itself; leave it out of the sweep.
    Release {
        /// Removed resource.
        id: ResourceId,
    },
    /// Keep-alive.
    Ping,
}

/// Reaper-to-client acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Whether the request was accepted.
    pub ok: bool,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    /// `{"ok":true}`
    #[must_use]
    pub fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    /// `{"ok":false,"error":…}`
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Serialize `message` as one protocol line, newline included.
///
/// # Errors
///
/// Returns `AppError::Reaper` if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
