//! Supervisor signal intake.

use herd_core::{HerdError, Result};
use signal_hook::consts::signal::{SIGCHLD, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

/// A signal the pool reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorSignal {
    /// At least one child changed state
    ChildExited,
    /// Shut the pool down; carries the signal number
    Terminate(i32),
}

/// Pending `SIGCHLD`, `SIGTERM` and `SIGINT` deliveries for one pool.
pub struct SupervisorSignals {
    signals: Signals,
}

impl SupervisorSignals {
    pub fn install() -> Result<Self> {
        let signals = Signals::new([SIGCHLD, SIGTERM, SIGINT]).map_err(|e| HerdError::SignalInstall {
            signal: "SIGCHLD, SIGTERM, SIGINT".into(),
            message: e.to_string(),
        })?;
        Ok(Self { signals })
    }

    /// Handle that wakes a blocked [`wait`](Self::wait) for good.
    pub fn handle(&self) -> Handle {
        self.signals.handle()
    }

    pub fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }

    /// Signals delivered since the last call, without blocking.
    pub fn pending(&mut self) -> Vec<SupervisorSignal> {
        self.signals.pending().filter_map(classify).collect()
    }

    /// Block until at least one signal arrives or the handle is closed.
    pub fn wait(&mut self) -> Vec<SupervisorSignal> {
        self.signals.wait().filter_map(classify).collect()
    }
}

fn classify(signal: i32) -> Option<SupervisorSignal> {
    match signal {
        SIGCHLD => Some(SupervisorSignal::ChildExited),
        SIGTERM | SIGINT => Some(SupervisorSignal::Terminate(signal)),
        _ => None,
    }
}
