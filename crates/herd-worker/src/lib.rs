//! Handlers, instances and services for HERD.
//!
//! A [`Handler`] is the unit of work. An [`Instance`] runs one handler in a
//! forked child process, and a [`Service`] owns every live instance of one
//! handler.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │       Service        │  owns live instances, assigns sequence numbers
//! └──────────┬───────────┘
//!            │ start / lifecycle events
//!            ▼
//! ┌──────────────────────┐
//! │       Instance       │  fork, probe, SIGTERM, SIGUSR1
//! └──────────┬───────────┘
//!            │ fork
//!            ▼
//! ┌──────────────────────┐
//! │    WorkerContext     │  child side: runs the handler, answers signals
//! └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use herd_worker::{Handler, HandlerError, Service};
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! #[derive(Default)]
//! struct Ticker {
//!     stopped: AtomicBool,
//! }
//!
//! impl Handler for Ticker {
//!     fn start(&self) -> Result<(), HandlerError> {
//!         while !self.stopped.load(Ordering::SeqCst) {
//!             std::thread::sleep(std::time::Duration::from_millis(100));
//!         }
//!         Ok(())
//!     }
//!
//!     fn stop(&self) {
//!         self.stopped.store(true, Ordering::SeqCst);
//!     }
//!
//!     fn report(&self) -> serde_json::Value {
//!         serde_json::json!({ "ticking": true })
//!     }
//! }
//!
//! let mut service = Service::new("ticker", Ticker::default());
//! if let Some(instance) = service.start() {
//!     println!("{} running as {:?}", instance.name(), instance.pid());
//!     instance.stop();
//! }
//! ```
//!
//! # Signals
//!
//! Inside a worker, `SIGTERM` calls [`Handler::stop`] and `SIGUSR1` pushes a
//! [`WorkerReport`] to the service's report address. Every other signal has
//! its default disposition.

pub mod context;
pub mod handler;
pub mod instance;
pub mod service;
pub mod types;


pub use context::WorkerContext;
pub use handler::{Handler, HandlerError};
pub use instance::Instance;
pub use service::Service;
pub use types::{InstanceInfo, Lifecycle, LifecycleEvent, WorkerReport};
