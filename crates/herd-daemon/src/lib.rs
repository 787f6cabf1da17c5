//! Daemon management for HERD.
//!
//! [`Daemon`] detaches a workload with the classic double fork, tracks it
//! through a pid file and stops it with `SIGTERM`. [`command::dispatch`] maps
//! the `start|stop|restart|status|pid` commands onto process exit codes.
//!
//! ```no_run
//! use herd_config::DaemonConfig;
//! use herd_daemon::{Daemon, command};
//!
//! let daemon = Daemon::new("herd", DaemonConfig { daemonise: true, ..Default::default() });
//! let code = command::dispatch(&daemon, Some("start"), || {
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     Ok(())
//! });
//! std::process::exit(code.into());
//! ```

pub mod command;
pub mod daemon;
pub mod pidfile;

pub use command::{DaemonCommand, UnknownCommand};
pub use daemon::Daemon;
pub use pidfile::PidFile;
