//! Error types for HERD operations.
//!
//! [`HerdError`] covers every failure the supervisor can observe. Per-instance
//! failures are isolated: the instance layer logs them and reports a boolean,
//! so most variants here surface in logs rather than aborting the pool.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Result type alias using [`HerdError`].
pub type Result<T> = std::result::Result<T, HerdError>;

/// Error type for all HERD operations.
#[derive(Debug, Error)]
pub enum HerdError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Settings file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Settings file is not valid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// A namespace section could not be deserialized
    #[error("Invalid configuration section {namespace}: {message}")]
    ConfigSection { namespace: String, message: String },

    /// A single value is out of range or malformed
    #[error("Invalid value for {field}: {message}")]
    ConfigValue { field: String, message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Pid file exists but does not hold a process id
    #[error("Invalid pid file {path}: {message}")]
    PidFile { path: PathBuf, message: String },

    // =========================================================================
    // Parsing Errors
    // =========================================================================
    /// JSON encode/decode error
    #[error("JSON error in {context}: {message}")]
    JsonParse {
        context: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// The OS refused to create a process
    #[error("Fork failed for {name}")]
    Fork {
        name: String,
        #[source]
        source: Errno,
    },

    /// The child was not observed alive within the start budget
    #[error("{name} not observed alive after {attempts} probes")]
    StartTimeout { name: String, attempts: u32 },

    /// The process did not exit within the stop budget
    #[error("{name} [{pid}] still running after {attempts} probes")]
    StopTimeout { name: String, pid: i32, attempts: u32 },

    /// Liveness probe or reap failed for a reason other than "gone"
    #[error("Failed to probe process {pid}")]
    Probe {
        pid: i32,
        #[source]
        source: Errno,
    },

    // =========================================================================
    // Signal Errors
    // =========================================================================
    /// Target process no longer exists
    #[error("No such process {pid}")]
    NoSuchProcess { pid: i32 },

    /// Not allowed to signal the target
    #[error("No permission to send {signal} to {pid}")]
    SignalPermission { pid: i32, signal: String },

    /// Any other signal delivery failure
    #[error("Failed to send {signal} to {pid}")]
    Signal {
        pid: i32,
        signal: String,
        #[source]
        source: Errno,
    },

    /// Installing or resetting a signal disposition failed
    #[error("Failed to install handler for {signal}: {message}")]
    SignalInstall { signal: String, message: String },

    // =========================================================================
    // Network / Report Errors
    // =========================================================================
    /// Address could not be resolved
    #[error("Cannot resolve address {address}: {message}")]
    AddressResolve { address: String, message: String },

    /// Listening socket could not be bound
    #[error("Failed to bind {address}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket operation failed
    #[error("Socket error {operation} on {address}")]
    Socket {
        operation: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker did not deliver its report in time
    #[error("Timed out after {timeout_ms}ms waiting for report from {name}")]
    ReportTimeout { name: String, timeout_ms: u64 },

    // =========================================================================
    // Pool / Daemon Errors
    // =========================================================================
    /// Pool start was rolled back
    #[error("Pool start aborted at service {service}: {message}")]
    PoolStart { service: String, message: String },

    /// A daemonization step failed
    #[error("Daemon {step} failed: {message}")]
    Daemon { step: String, message: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in HERD)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HerdError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create a ConfigNotFound error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a ConfigNotFound error with source
    pub fn config_not_found_with_source(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create a ConfigValue error
    pub fn config_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a JSON error
    pub fn json_parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonParse {
            context: context.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a socket error
    pub fn socket(operation: impl Into<String>, address: impl ToString, source: std::io::Error) -> Self {
        Self::Socket {
            operation: operation.into(),
            address: address.to_string(),
            source,
        }
    }

    /// Classify a failed `kill(2)`.
    ///
    /// `ESRCH` maps to [`HerdError::NoSuchProcess`], `EPERM` to
    /// [`HerdError::SignalPermission`].
    pub fn signal(pid: i32, signal: impl Into<String>, errno: Errno) -> Self {
        match errno {
            Errno::ESRCH => Self::NoSuchProcess { pid },
            Errno::EPERM => Self::SignalPermission {
                pid,
                signal: signal.into(),
            },
            source => Self::Signal {
                pid,
                signal: signal.into(),
                source,
            },
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true for failures that mean "the process is already gone".
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NoSuchProcess { .. })
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. }
                | Self::ConfigInvalid { .. }
                | Self::ConfigSection { .. }
                | Self::ConfigValue { .. }
        )
    }

    /// Returns true if this error concerns process creation or control
    pub fn is_process_error(&self) -> bool {
        matches!(
            self,
            Self::Fork { .. }
                | Self::StartTimeout { .. }
                | Self::StopTimeout { .. }
                | Self::Probe { .. }
                | Self::NoSuchProcess { .. }
                | Self::SignalPermission { .. }
                | Self::Signal { .. }
        )
    }

    /// Returns actionable guidance for the operator
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => Some("Pass --config or create /etc/herd/herd.yaml"),
            Self::ConfigInvalid { .. } | Self::ConfigSection { .. } => {
                Some("Check YAML syntax and the section layout of the settings file")
            }
            Self::SignalPermission { .. } => {
                Some("Run the command as the user that owns the supervised processes")
            }
            Self::Bind { .. } => Some("Another process may already be listening on that address"),
            Self::StopTimeout { .. } => {
                Some("The workload ignores SIGTERM; inspect it or kill it manually")
            }
            Self::PidFile { .. } => Some("Remove the stale pid file and retry"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_not_found_error() {
        let err = HerdError::config_not_found("/etc/herd/herd.yaml");
        assert!(err.to_string().contains("Configuration not found"));
        assert!(err.is_config_error());
        assert!(err.guidance().is_some());
    }

    #[test]
    fn test_signal_classification() {
        assert!(matches!(
            HerdError::signal(42, "SIGTERM", Errno::ESRCH),
            HerdError::NoSuchProcess { pid: 42 }
        ));
        assert!(HerdError::signal(42, "SIGTERM", Errno::ESRCH).is_benign());

        let err = HerdError::signal(1, "SIGTERM", Errno::EPERM);
        assert!(matches!(err, HerdError::SignalPermission { pid: 1, .. }));
        assert!(!err.is_benign());
        assert!(err.is_process_error());

        let err = HerdError::signal(7, "SIGUSR1", Errno::EINVAL);
        assert!(matches!(err, HerdError::Signal { .. }));
    }

    #[test]
    fn test_stop_timeout_message() {
        let err = HerdError::StopTimeout {
            name: "web-1".into(),
            pid: 4242,
            attempts: 10,
        };
        assert_eq!(err.to_string(), "web-1 [4242] still running after 10 probes");
        assert!(err.guidance().is_some());
    }
}
