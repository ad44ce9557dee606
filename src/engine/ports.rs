//! Exposed-port notation (`80/tcp`) and host bindings.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// TCP (default when omitted).
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

impl Protocol {
    /// Lowercase protocol name as used in port notation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

/// A port exposed inside a resource, e.g. `80/tcp`.
///
/// Ordering is by port number first, which makes "lowest exposed port"
/// a plain `min()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExposedPort {
    /// Port number inside the resource.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl ExposedPort {
    /// A TCP port.
    #[must_use]
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    /// A UDP port.
    #[must_use]
    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl Display for ExposedPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_str())
    }
}

impl FromStr for ExposedPort {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (port, proto) = match raw.trim().split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (raw.trim(), "tcp"),
        };

        let port: u16 = port
            .parse()
            .map_err(|err| AppError::Config(format!("invalid port '{raw}': {err}")))?;
        if port == 0 {
            return Err(AppError::Config(format!("invalid port '{raw}': must be non-zero")));
        }

        let protocol = match proto.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "sctp" => Protocol::Sctp,
            other => {
                return Err(AppError::Config(format!(
                    "invalid port '{raw}': unknown protocol '{other}'"
                )))
            }
        };

        Ok(Self { port, protocol })
    }
}

/// Host side of a port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host interface the port is bound on, when reported.
    pub host_ip: Option<String>,
    /// Host port number.
    pub host_port: u16,
}
