//! Process pool for HERD.
//!
//! A [`Pool`] runs several [`Service`](herd_worker::Service)s at their desired
//! instance counts, restarts instances that die abnormally and, when a report
//! section is configured, serves an aggregate JSON status report.
//!
//! # Report protocol
//!
//! ```text
//!   operator ──connect──▶ outgoing ──┐
//!                                    │ for each live instance:
//!                                    │   SIGUSR1 ──▶ worker
//!   worker ──connect──▶ incoming ────┤   one JSON payload per connection
//!                                    ▼
//!   operator ◀── {"success": true, "instances": {...}, ...}, then close
//! ```
//!
//! # Example
//!
//! ```no_run
//! use herd_config::Settings;
//! use herd_pool::Pool;
//!
//! # struct Stub;
//! # impl herd_worker::Handler for Stub {
//! #     fn start(&self) -> Result<(), herd_worker::HandlerError> { Ok(()) }
//! #     fn stop(&self) {}
//! #     fn report(&self) -> serde_json::Value { serde_json::Value::Null }
//! # }
//! # fn handler() -> impl herd_worker::Handler { Stub }
//! fn main() -> herd_core::Result<()> {
//!     let settings = Settings::from_file("/etc/herd/herd.yaml")?;
//!     let mut pool = Pool::from_settings(&settings, "pool.web")?;
//!     pool.attach(herd_worker::Service::new("web", handler()), 4);
//!     pool.serve()
//! }
//! ```

pub mod pool;
pub mod report;
pub mod signals;

pub use pool::{Pool, PoolState, StopHandle};
pub use report::{PoolReport, ReportCollector};
pub use signals::{SupervisorSignal, SupervisorSignals};
