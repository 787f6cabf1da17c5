//! Typed configuration sections.

use std::collections::BTreeMap;
use std::path::PathBuf;

use herd_core::{Address, HerdError, Result};
use serde::{Deserialize, Serialize};

use crate::timings::Timings;

/// A user or group, by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Principal {
    Id(u32),
    Name(String),
}

/// Daemonization settings (`daemon.<name>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Detach into the background; otherwise run inline
    pub daemonise: bool,
    /// Pid file path, `/var/run/<name>.pid` when unset
    pub pid: Option<PathBuf>,
    pub uid: Option<Principal>,
    pub gid: Option<Principal>,
    /// Octal file-creation mask, e.g. `"022"`
    pub umask: Option<String>,
    /// Working directory of the detached process
    pub chdir: Option<PathBuf>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl DaemonConfig {
    /// Pid file for a daemon called `name`.
    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.pid
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/var/run/{name}.pid")))
    }

    /// The umask parsed as octal.
    pub fn umask_bits(&self) -> Result<Option<u32>> {
        self.umask
            .as_deref()
            .map(|raw| {
                u32::from_str_radix(raw.trim_start_matches("0o"), 8)
                    .map_err(|e| HerdError::config_value("umask", format!("{raw:?}: {e}")))
            })
            .transpose()
    }
}

/// Report socket pair (`pool.<name>.report`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Internal address workers push their payloads to
    pub incoming: Address,
    /// Public address operators read the aggregate report from
    pub outgoing: Address,
}

/// A command-running service, as the `herd` binary configures it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// argv of the supervised program
    pub command: Vec<String>,
    /// Desired instance count; zero registers the service without spawning it
    #[serde(default)]
    pub instances: usize,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Pool settings (`pool.<name>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub report: Option<ReportConfig>,
    pub timings: Timings,
    pub services: Vec<ServiceConfig>,
}
