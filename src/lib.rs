#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod logs;
pub mod reaper;
pub mod retry;
pub mod session;
pub mod wait;

pub use config::BerthConfig;
pub use errors::{AppError, Result};
pub use session::{Network, NetworkSpec, Provider, Session, SessionSpec, SessionState};
