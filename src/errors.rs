//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Crate error enumeration covering all session, wait, log and reaper failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Transient engine failure (network blip, daemon hiccup); safe to retry.
    Engine(String),
    /// Requested engine resource does not exist; never retried.
    NotFound(String),
    /// A readiness wait exceeded its startup timeout.
    Timeout(String),
    /// A blocking wait was cancelled by its caller.
    Cancelled(String),
    /// Malformed or truncated frame in a multiplexed log stream.
    Frame(String),
    /// Reaper could not be provisioned, reached or spoken to.
    Reaper(String),
    /// HTTP client construction or request failure.
    Http(String),
    /// Operation is not valid in the current session state.
    InvalidState(String),
    /// File-system, socket or other I/O failure.
    Io(String),
}

impl AppError {
    /// Whether the failure is transient and the operation may be retried.
    ///
    /// Only [`AppError::Engine`] and [`AppError::Io`] qualify; everything else
    /// (not-found, readiness timeout, reaper connectivity, framing) is permanent.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Engine(_) | Self::Io(_))
    }

    /// Prefix the message with `context`, keeping the variant.
    #[must_use]
    pub fn context(self, context: impl Display) -> Self {
        match self {
            Self::Config(msg) => Self::Config(format!("{context}: {msg}")),
            Self::Engine(msg) => Self::Engine(format!("{context}: {msg}")),
            Self::NotFound(msg) => Self::NotFound(format!("{context}: {msg}")),
            Self::Timeout(msg) => Self::Timeout(format!("{context}: {msg}")),
            Self::Cancelled(msg) => Self::Cancelled(format!("{context}: {msg}")),
            Self::Frame(msg) => Self::Frame(format!("{context}: {msg}")),
            Self::Reaper(msg) => Self::Reaper(format!("{context}: {msg}")),
            Self::Http(msg) => Self::Http(format!("{context}: {msg}")),
            Self::InvalidState(msg) => Self::InvalidState(format!("{context}: {msg}")),
            Self::Io(msg) => Self::Io(format!("{context}: {msg}")),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Engine(msg) => write!(f, "engine: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Frame(msg) => write!(f, "frame: {msg}"),
            Self::Reaper(msg) => write!(f, "reaper: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Reaper(format!("malformed control message: {err}"))
    }
}
