//! # herd-core
//!
//! Core types, errors, and utilities for the HERD process supervisor.
//!
//! This crate provides:
//! - [`HerdError`] - Error types for every supervisor operation
//! - [`logging`] - Tracing setup shared by the supervisor and its workers
//! - [`process`] - Signal delivery and liveness probes
//! - [`types`] - Addresses and timestamps used across crates
//!
//! ## Example
//!
//! ```no_run
//! use herd_core::{HerdError, Result, logging};
//!
//! fn main() -> herd_core::Result<()> {
//!     logging::init_logging(None, false)?;
//!
//!     let settings = std::path::Path::new("/etc/herd/herd.yaml");
//!     if !settings.exists() {
//!         return Err(HerdError::config_not_found(settings));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod process;
pub mod types;

pub use error::{HerdError, Result};
pub use logging::init_logging;
pub use process::{Probe, exit_now, probe_child, process_exists, send_signal, set_process_title};
pub use types::{Address, format_timestamp, process_title};
