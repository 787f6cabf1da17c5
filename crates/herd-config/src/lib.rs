//! Configuration for HERD.
//!
//! [`Settings`] is a YAML document addressed by dotted namespaces
//! (`"pool.web"`, `"daemon.herd"`). Each component pulls its own typed section
//! out of it:
//!
//! ```yaml
//! daemon:
//!   herd:
//!     daemonise: true
//!     pid: /run/herd.pid
//! pool:
//!   web:
//!     report:
//!       incoming: ["127.0.0.1", 8881]
//!       outgoing: ["127.0.0.1", 8880]
//! ```
//!
//! ```no_run
//! use herd_config::{PoolConfig, Settings};
//!
//! # fn main() -> herd_core::Result<()> {
//! let settings = Settings::from_file("/etc/herd/herd.yaml")?;
//! let pool: PoolConfig = settings.section("pool.web")?.unwrap_or_default();
//! # Ok(())
//! # }
//! ```

pub mod sections;
pub mod settings;
pub mod timings;

pub use sections::{DaemonConfig, PoolConfig, Principal, ReportConfig, ServiceConfig};
pub use settings::Settings;
pub use timings::{PollBudget, Timings};
