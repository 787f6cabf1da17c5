//! A handler that runs an external command.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{Context, anyhow};
use herd_config::ServiceConfig;
use herd_core::send_signal;
use herd_worker::{Handler, HandlerError};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde_json::json;
use tracing::{debug, warn};

/// Runs `command` as a child of the worker and mirrors its exit status.
///
/// `stop` forwards `SIGTERM` to the child. A child killed after a stop request
/// counts as a clean exit.
#[derive(Debug)]
pub struct ExecHandler {
    command: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    /// 0 while no child is running
    child_pid: AtomicI32,
    stop_requested: AtomicBool,
}

impl ExecHandler {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            cwd: None,
            child_pid: AtomicI32::new(0),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        let mut handler = Self::new(config.command.clone());
        handler.env = config.env.clone();
        handler.cwd = config.cwd.clone();
        handler
    }

    fn signal_child(&self) {
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return;
        }
        if let Err(e) = send_signal(Pid::from_raw(pid), Signal::SIGTERM) {
            if !e.is_benign() {
                warn!(child = pid, error = %e, "cannot forward stop to command");
            }
        }
    }
}

impl Handler for ExecHandler {
    fn start(&self) -> Result<(), HandlerError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("service command is empty"))?;

        let mut command = Command::new(program);
        command.args(args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().with_context(|| format!("spawning {program}"))?;
        self.child_pid.store(child.id() as i32, Ordering::SeqCst);
        debug!(program = %program, child = child.id(), "command spawned");

        // a stop that arrived while spawning has nothing to signal yet
        if self.stop_requested.load(Ordering::SeqCst) {
            self.signal_child();
        }

        let status = child.wait().with_context(|| format!("waiting for {program}"));
        self.child_pid.store(0, Ordering::SeqCst);
        let status = status?;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(HandlerError::Exit(code)),
            None if self.stop_requested.load(Ordering::SeqCst) => Ok(()),
            None => Err(anyhow!("{program} killed by signal {:?}", status.signal()).into()),
        }
    }

    fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.signal_child();
    }

    fn report(&self) -> serde_json::Value {
        let pid = self.child_pid.load(Ordering::SeqCst);
        json!({
            "command": self.command,
            "child_pid": (pid > 0).then_some(pid),
            "stop_requested": self.stop_requested.load(Ordering::SeqCst),
        })
    }
}
