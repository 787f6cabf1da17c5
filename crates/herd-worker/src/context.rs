//! The child side of an instance.
//!
//! After `fork` the worker owns a copy of the supervisor's memory, including its
//! signal dispositions. The context resets those, routes `SIGTERM` and `SIGUSR1`
//! through a self-pipe to a control thread, and runs the handler on the main
//! thread until it returns.
//!
//! The instance forks with both control signals blocked. They stay blocked until
//! the forwarding handlers are installed, so a stop or report request sent right
//! after `fork` is held pending instead of hitting the default disposition.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use herd_core::{Address, HerdError, Result, exit_now, format_timestamp, set_process_title};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask, sigaction};
use nix::unistd::{close, getpid};
use tracing::{debug, error, info, warn};

use crate::handler::{Handler, HandlerError};
use crate::types::WorkerReport;

const CONTROL_SIGNALS: [Signal; 2] = [Signal::SIGTERM, Signal::SIGUSR1];

/// Write end of the self-pipe, -1 until installed.
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signal: libc::c_int) {
    let fd = SIGNAL_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signal as u8;
        // SAFETY: write(2) is async-signal-safe and the fd is never closed
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

/// What a freshly forked worker needs to know.
pub(crate) struct WorkerSpec {
    pub name: String,
    pub handler: Arc<dyn Handler>,
    pub report_address: Option<Address>,
    pub send_timeout: Duration,
    /// Supervisor-only descriptors the worker must not hold open
    pub close_fds: Vec<RawFd>,
}

/// Entry point of a forked worker. Never returns to the caller's code.
pub(crate) fn enter(spec: WorkerSpec) -> ! {
    let code = panic::catch_unwind(AssertUnwindSafe(move || {
        for fd in &spec.close_fds {
            let _ = close(*fd);
        }
        set_process_title(&spec.name);
        reset_signal_dispositions();

        let context = Arc::new(WorkerContext::new(
            spec.name,
            spec.handler,
            spec.report_address,
            spec.send_timeout,
        ));
        context.run()
    }))
    .unwrap_or(1);

    exit_now(code)
}

/// `SIGTERM` and `SIGUSR1`, the signals a worker forwards to its control thread.
pub(crate) fn control_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in CONTROL_SIGNALS {
        set.add(signal);
    }
    set
}

/// Default disposition for every catchable signal. The mask is left alone.
fn reset_signal_dispositions() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in Signal::iterator() {
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing SIG_DFL cannot violate handler invariants
        let _ = unsafe { sigaction(signal, &default) };
    }
}

/// Clear the mask of the calling thread, releasing any pending control signal.
fn unblock_signals() {
    if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None) {
        warn!(%errno, "failed to clear signal mask");
    }
}

/// Route the control signals into a pipe and return its read end.
fn install_forwarding() -> Result<UnixStream> {
    let (reader, writer) = UnixStream::pair().map_err(|e| HerdError::SignalInstall {
        signal: "SIGTERM, SIGUSR1".into(),
        message: e.to_string(),
    })?;
    writer.set_nonblocking(true).map_err(|e| HerdError::SignalInstall {
        signal: "SIGTERM, SIGUSR1".into(),
        message: e.to_string(),
    })?;
    SIGNAL_PIPE.store(writer.into_raw_fd(), Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in CONTROL_SIGNALS {
        // SAFETY: forward_signal only performs an async-signal-safe write
        unsafe { sigaction(signal, &action) }.map_err(|errno| HerdError::SignalInstall {
            signal: signal.as_str().into(),
            message: errno.desc().into(),
        })?;
    }
    Ok(reader)
}

/// Runtime state of one worker process.
pub struct WorkerContext {
    name: String,
    handler: Arc<dyn Handler>,
    report_address: Option<Address>,
    send_timeout: Duration,
    pid: i32,
    started_at: DateTime<Local>,
    stopped: AtomicBool,
}

impl WorkerContext {
    /// Context for the calling process.
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        report_address: Option<Address>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            report_address,
            send_timeout,
            pid: getpid().as_raw(),
            started_at: Local::now(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run the handler to completion and return the exit status.
    ///
    /// `Ok` gives 0, [`HandlerError::Exit`] gives its status, and a failure or
    /// panic stops the handler and gives 1.
    pub fn run(self: Arc<Self>) -> i32 {
        let pipe = match install_forwarding() {
            Ok(pipe) => pipe,
            Err(e) => {
                error!(worker = %self.name, error = %e, "signal setup failed");
                return 1;
            }
        };

        let control = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name("herd-control".into())
            .spawn(move || control.control_loop(pipe));
        if let Err(e) = spawned {
            error!(worker = %self.name, error = %e, "failed to spawn control thread");
            return 1;
        }
        // the control thread keeps the inherited block; signals land on this thread
        unblock_signals();

        info!(worker = %self.name, pid = self.pid, handler = %self.handler.name(), "worker started");

        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.start())) {
            Ok(Ok(())) => {
                info!(worker = %self.name, "handler finished");
                0
            }
            Ok(Err(HandlerError::Exit(code))) => {
                info!(worker = %self.name, code, "handler requested exit");
                code
            }
            Ok(Err(HandlerError::Failed(err))) => {
                error!(worker = %self.name, error = %err, "handler failed");
                self.stop();
                1
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("non-string panic payload");
                error!(worker = %self.name, panic = message, "handler panicked");
                self.stop();
                1
            }
        }
    }

    /// React to a control signal.
    pub fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::SIGTERM => {
                info!(worker = %self.name, "stop requested");
                self.stop();
            }
            Signal::SIGUSR1 => {
                if let Err(e) = self.send_report() {
                    error!(worker = %self.name, error = %e, "report not delivered");
                }
            }
            other => debug!(worker = %self.name, signal = %other, "ignoring signal"),
        }
    }

    fn stop(&self) {
        self.handler.stop();
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn control_loop(&self, mut pipe: UnixStream) {
        let mut buf = [0u8; 32];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        if let Ok(signal) = Signal::try_from(i32::from(byte)) {
                            self.handle_signal(signal);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "control pipe closed");
                    break;
                }
            }
        }
    }

    /// Build the report payload.
    pub fn report_payload(&self) -> WorkerReport {
        let report = self.handler.report();
        if report.is_null() {
            warn!(worker = %self.name, "handler report is empty");
        }
        WorkerReport {
            pid: self.pid,
            stopped: self.is_stopped(),
            started_at: format_timestamp(self.started_at),
            online: (Local::now() - self.started_at).num_seconds(),
            handler: self.handler.name(),
            name: self.name.clone(),
            report,
        }
    }

    /// Push one report to the report address.
    ///
    /// Connect and write are both bounded by the send timeout. Without a
    /// report address this does nothing.
    pub fn send_report(&self) -> Result<()> {
        let Some(address) = &self.report_address else {
            debug!(worker = %self.name, "no report address, skipping report");
            return Ok(());
        };

        let body = serde_json::to_vec(&self.report_payload())
            .map_err(|e| HerdError::json_parse("encoding worker report", e))?;

        let target = address.resolve()?;
        let mut stream = TcpStream::connect_timeout(&target, self.send_timeout).map_err(|e| {
            if e.kind() == ErrorKind::TimedOut {
                warn!(worker = %self.name, %address, "report connection timeout");
            }
            HerdError::socket("connect", address, e)
        })?;
        stream
            .set_write_timeout(Some(self.send_timeout))
            .map_err(|e| HerdError::socket("configure", address, e))?;
        stream
            .write_all(&body)
            .map_err(|e| HerdError::socket("write", address, e))?;
        let _ = stream.shutdown(Shutdown::Write);

        debug!(worker = %self.name, bytes = body.len(), "report sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::TcpListener;

    struct Static;

    impl Handler for Static {
        fn start(&self) -> std::result::Result<(), HandlerError> {
            Ok(())
        }

        fn stop(&self) {}

        fn report(&self) -> serde_json::Value {
            json!({"status": 100})
        }
    }

    fn context(address: Option<Address>) -> WorkerContext {
        WorkerContext::new("static-1", Arc::new(Static), address, Duration::from_millis(200))
    }

    #[test]
    fn test_report_payload() {
        let payload = context(None).report_payload();
        assert_eq!(payload.pid, std::process::id() as i32);
        assert_eq!(payload.name, "static-1");
        assert_eq!(payload.handler, "Static");
        assert_eq!(payload.report, json!({"status": 100}));
        assert!(!payload.stopped);
        assert!(payload.online >= 0);
    }

    #[test]
    fn test_sigusr1_pushes_report() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let ctx = context(Some(Address::new("127.0.0.1", port)));

        ctx.handle_signal(Signal::SIGUSR1);

        let (mut stream, _) = listener.accept().unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();
        let received: WorkerReport = serde_json::from_str(&body).unwrap();
        assert_eq!(received.name, "static-1");
        assert_eq!(received.report["status"], 100);
    }

    #[test]
    fn test_sigterm_marks_stopped() {
        let ctx = context(None);
        ctx.handle_signal(Signal::SIGTERM);
        assert!(ctx.is_stopped());
        assert!(ctx.report_payload().stopped);
    }

    #[test]
    fn test_unreachable_report_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = context(Some(Address::new("127.0.0.1", port))).send_report().unwrap_err();
        assert!(matches!(err, HerdError::Socket { .. }));
    }
}
