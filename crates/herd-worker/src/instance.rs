//! One forked worker process running a handler.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread;

use herd_config::Timings;
use herd_core::{Address, HerdError, Probe, Result, log_instance_event, probe_child, send_signal};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use nix::unistd::{ForkResult, Pid, fork};
use tracing::{debug, error, info, warn};

use crate::context::{self, WorkerSpec};
use crate::handler::Handler;
use crate::types::{InstanceInfo, Lifecycle, LifecycleEvent};

/// A handler running in its own process.
///
/// The pid is set while the process is believed to be running and cleared once
/// its exit has been observed. Every liveness answer comes from a fresh probe.
pub struct Instance {
    seq: u32,
    name: String,
    handler: Arc<dyn Handler>,
    report_address: Option<Address>,
    timings: Timings,
    close_fds: Vec<RawFd>,
    pid: Option<Pid>,
    last_pid: Option<Pid>,
    exit_code: Option<i32>,
    reported_count: u64,
    lifecycle: Option<Sender<LifecycleEvent>>,
}

impl Instance {
    /// A not-yet-started instance named `<service>-<seq>`.
    pub fn new(service: &str, seq: u32, handler: Arc<dyn Handler>) -> Self {
        Self {
            seq,
            name: format!("{service}-{seq}"),
            handler,
            report_address: None,
            timings: Timings::default(),
            close_fds: Vec::new(),
            pid: None,
            last_pid: None,
            exit_code: None,
            reported_count: 0,
            lifecycle: None,
        }
    }

    /// Where the worker pushes its reports.
    pub fn with_report_address(mut self, address: Option<Address>) -> Self {
        self.report_address = address;
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Announce start/stop transitions on this channel.
    pub fn with_lifecycle(mut self, sender: Sender<LifecycleEvent>) -> Self {
        self.lifecycle = Some(sender);
        self
    }

    /// Descriptors the worker closes right after fork.
    pub fn set_close_fds(&mut self, fds: Vec<RawFd>) {
        self.close_fds = fds;
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the running process.
    pub fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    /// Pid of the most recent process, even after it exited.
    pub fn last_pid(&self) -> Option<i32> {
        self.last_pid.map(Pid::as_raw)
    }

    /// Exit status of the last observed exit. `None` if unknown or killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Reports successfully requested so far.
    pub fn reported_count(&self) -> u64 {
        self.reported_count
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            pid: self.pid(),
            name: self.name.clone(),
            reported_count: self.reported_count,
        }
    }

    /// Probe the process, reaping it if it has exited.
    ///
    /// An ambiguous probe counts as not running.
    pub fn is_running(&mut self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };

        match probe_child(pid) {
            Ok(Probe::Alive) => true,
            Ok(Probe::Exited(code)) => {
                debug!(instance = %self.name, %pid, ?code, "process exited");
                self.exit_code = code;
                self.pid = None;
                false
            }
            Ok(Probe::Gone) => {
                self.pid = None;
                false
            }
            Err(e) => {
                warn!(instance = %self.name, %pid, error = %e, "liveness probe failed");
                false
            }
        }
    }

    /// Fork a worker and wait for it to be observed alive.
    ///
    /// The first probe comes one probe interval after the fork, so a worker
    /// that crashes straight away is reported as a failed start. Announces
    /// [`Lifecycle::Started`] on success.
    pub fn start(&mut self) -> bool {
        let pid = match self.spawn() {
            Ok(pid) => pid,
            Err(e) => {
                error!(instance = %self.name, error = %e, "failed to start instance");
                return false;
            }
        };

        self.pid = Some(pid);
        self.last_pid = Some(pid);
        self.exit_code = None;

        let budget = self.timings.start_probe;
        thread::sleep(budget.interval);
        if budget.wait_for(|| self.is_running()) {
            log_instance_event!(self.name, "started", pid = pid.as_raw());
            self.announce(Lifecycle::Started);
            true
        } else {
            let e = HerdError::StartTimeout {
                name: self.name.clone(),
                attempts: budget.attempts,
            };
            error!(instance = %self.name, exit_code = ?self.exit_code, error = %e, "instance did not come up");
            false
        }
    }

    /// Fork with the control signals blocked; the worker unblocks them once its
    /// handlers are installed.
    fn spawn(&self) -> Result<Pid> {
        let mut previous = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&context::control_signals()),
            Some(&mut previous),
        )
        .map_err(|errno| HerdError::SignalInstall {
            signal: "SIGTERM, SIGUSR1".into(),
            message: errno.desc().into(),
        })?;

        // SAFETY: the child branch enters the worker and never returns here
        let forked = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => context::enter(WorkerSpec {
                name: self.name.clone(),
                handler: Arc::clone(&self.handler),
                report_address: self.report_address.clone(),
                send_timeout: self.timings.report_send_timeout,
                close_fds: self.close_fds.clone(),
            }),
            Err(source) => Err(HerdError::Fork {
                name: self.name.clone(),
                source,
            }),
        };

        if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None) {
            warn!(instance = %self.name, %errno, "failed to restore signal mask");
        }
        forked
    }

    /// Ask the worker to terminate and wait for it to exit.
    ///
    /// Stopping an instance that is not running succeeds. Returns false when
    /// the process outlives the stop budget; it is never force-killed.
    /// Announces [`Lifecycle::Stopped`] on success.
    pub fn stop(&mut self) -> bool {
        let running = self.is_running();
        let Some(pid) = self.pid.filter(|_| running) else {
            warn!(instance = %self.name, "stop requested for an instance that is not running");
            self.mark_stopped();
            return true;
        };

        match send_signal(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(e) if e.is_benign() => {
                self.is_running();
                self.mark_stopped();
                return true;
            }
            Err(e) => {
                error!(instance = %self.name, error = %e, "failed to signal instance");
                return false;
            }
        }

        let budget = self.timings.stop_probe;
        if budget.wait_for(|| !self.is_running()) {
            log_instance_event!(self.name, "stopped", pid = pid.as_raw(), exit_code = ?self.exit_code);
            self.mark_stopped();
            true
        } else {
            let e = HerdError::StopTimeout {
                name: self.name.clone(),
                pid: pid.as_raw(),
                attempts: budget.attempts,
            };
            error!(instance = %self.name, error = %e, "instance did not stop");
            false
        }
    }

    /// Stop, then start again under the same name.
    pub fn restart(&mut self) -> bool {
        self.stop() && self.start()
    }

    /// Ask the worker to push a report.
    ///
    /// False when the worker is down or has no report address to push to.
    pub fn report(&mut self) -> bool {
        if !self.is_running() {
            error!(instance = %self.name, "cannot request report, instance is down");
            return false;
        }
        if self.report_address.is_none() {
            debug!(instance = %self.name, "no report address configured");
            return false;
        }
        let Some(pid) = self.pid else {
            return false;
        };

        match send_signal(pid, Signal::SIGUSR1) {
            Ok(()) => {
                self.reported_count += 1;
                true
            }
            Err(e) => {
                error!(instance = %self.name, error = %e, "failed to request report");
                false
            }
        }
    }

    /// Drop a dead instance from its service without restarting it.
    pub fn retire(&mut self) {
        info!(instance = %self.name, exit_code = ?self.exit_code, "retiring instance");
        self.mark_stopped();
    }

    fn mark_stopped(&mut self) {
        self.pid = None;
        self.announce(Lifecycle::Stopped);
    }

    fn announce(&self, state: Lifecycle) {
        if let Some(sender) = &self.lifecycle {
            let _ = sender.send(LifecycleEvent {
                seq: self.seq,
                state,
            });
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .field("reported_count", &self.reported_count)
            .finish()
    }
}
