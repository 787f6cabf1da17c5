//! Logging infrastructure for HERD.
//!
//! Structured logging using the `tracing` ecosystem. The supervisor and every
//! worker it forks share the subscriber installed here.
//!
//! ## Features
//!
//! - JSON lines written to `<log_dir>/herd.log` (rotated daily)
//! - Compact console output on stderr
//! - `RUST_LOG` overrides the default `herd=info` filter
//!
//! The file writer is synchronous. Pools fork after logging is initialized and a
//! background writer thread would not exist in the children, so their events
//! would be silently queued and lost.
//!
//! ## Example
//!
//! ```no_run
//! use herd_core::logging;
//!
//! logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("supervisor started");
//! tracing::debug!(instance = "web-1", pid = 4242, "instance forked");
//! ```

use std::path::PathBuf;

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{HerdError, Result};

/// Initialize the HERD logging system.
///
/// # Arguments
///
/// * `log_dir` - Optional custom log directory. Defaults to `~/.herd/logs/`
/// * `verbose` - If true, sets log level to DEBUG. Otherwise uses INFO.
///
/// Calling this twice in one process is an error.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<()> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir)
        .map_err(|e| HerdError::io("creating log directory", &log_dir, e))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "herd.log");

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("herd={default_level}")));

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| HerdError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(())
}

/// Initialize minimal console-only logging for testing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Get the default log directory path.
///
/// Returns `~/.herd/logs/`
pub fn default_log_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| HerdError::Internal {
        message: "HOME environment variable not set".into(),
    })?;

    Ok(PathBuf::from(home).join(".herd").join("logs"))
}

/// Log an instance lifecycle event.
///
/// ```ignore
/// log_instance_event!("web-1", "started", pid = 4242);
/// log_instance_event!("web-1", "died", exit_code = ?Some(1));
/// ```
#[macro_export]
macro_rules! log_instance_event {
    ($instance:expr, $event:expr) => {
        tracing::info!(
            target: "herd::instance",
            instance = %$instance,
            event = $event,
            "instance event"
        )
    };
    ($instance:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "herd::instance",
            instance = %$instance,
            event = $event,
            $($field)*,
            "instance event"
        )
    };
}
