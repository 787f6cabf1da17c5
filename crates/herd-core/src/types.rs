//! Shared type definitions used across HERD crates.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{HerdError, Result};

/// Timestamp layout used in every report document.
pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S %Z";

/// A `(host, port)` pair.
///
/// Serialized as a two-element sequence, the layout used in settings files:
///
/// ```yaml
/// incoming: ["127.0.0.1", 8881]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first socket address the host maps to.
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| HerdError::AddressResolve {
                address: self.to_string(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| HerdError::AddressResolve {
                address: self.to_string(),
                message: "no addresses returned".into(),
            })
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<Address> for (String, u16) {
    fn from(addr: Address) -> Self {
        (addr.host, addr.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Render a timestamp the way report documents carry it.
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Name a process shows in `ps`: lower-cased, whitespace replaced by `-`.
pub fn process_title(name: &str) -> String {
    name.chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect()
}
