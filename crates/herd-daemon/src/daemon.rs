//! Double-fork daemonization around a workload.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use herd_config::{DaemonConfig, Principal, Settings, Timings};
use herd_core::{HerdError, Result, exit_now, process_exists, send_signal, set_process_title};
use nix::sys::signal::Signal;
use nix::sys::stat::{Mode, umask};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Group, Pid, Uid, User, chdir, dup2, fork, getpid, setgid, setsid, setuid};
use tracing::{error, info, instrument, warn};

use crate::pidfile::PidFile;

/// Exit status of the detached process when setup fails before the workload runs.
pub mod exit_code {
    /// chdir, setsid or umask failed
    pub const SETUP: i32 = 1;
    pub const SECOND_FORK: i32 = 2;
    pub const REDIRECT: i32 = 3;
    pub const PID_FILE: i32 = 4;
    pub const PRIVILEGES: i32 = 5;
}

/// Resolved group and user to switch to.
#[derive(Debug, Clone, Copy, Default)]
struct Credentials {
    gid: Option<Gid>,
    uid: Option<Uid>,
}

/// A named background service tracked through its pid file.
#[derive(Debug, Clone)]
pub struct Daemon {
    name: String,
    config: DaemonConfig,
    pid_file: PidFile,
    timings: Timings,
}

impl Daemon {
    pub fn new(name: impl Into<String>, config: DaemonConfig) -> Self {
        let name = name.into();
        let pid_file = PidFile::new(config.pid_path(&name));
        Self {
            name,
            config,
            pid_file,
            timings: Timings::default(),
        }
    }

    /// A daemon configured from `daemon.<name>`, defaults when absent.
    pub fn from_settings(settings: &Settings, name: &str) -> Result<Self> {
        let config: DaemonConfig = settings
            .section(&format!("daemon.{name}"))?
            .unwrap_or_default();
        Ok(Self::new(name, config))
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// Pid recorded in the pid file. An unreadable file counts as no pid.
    pub fn pid(&self) -> Option<i32> {
        match self.pid_file.read() {
            Ok(pid) => pid.map(Pid::as_raw),
            Err(e) => {
                warn!(daemon = %self.name, error = %e, "ignoring pid file");
                None
            }
        }
    }

    /// Whether the recorded pid names a live process.
    pub fn is_running(&self) -> bool {
        self.pid().is_some_and(|pid| process_exists(Pid::from_raw(pid)))
    }

    /// Run `workload` as a daemon, or inline when daemonisation is disabled.
    ///
    /// Detached: returns once the daemon is observed running, false if it is
    /// not within the start budget. Inline: returns after the workload, false
    /// if it failed.
    #[instrument(level = "info", skip(self, workload), fields(daemon = %self.name))]
    pub fn start<F>(&self, workload: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        if !self.config.daemonise {
            warn!("daemonisation disabled, running in the foreground");
            return match workload() {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "workload failed");
                    false
                }
            };
        }

        if self.is_running() {
            warn!(pid = ?self.pid(), "already running");
            return true;
        }

        let prepared = self
            .config
            .umask_bits()
            .and_then(|umask| self.credentials().map(|creds| (umask, creds)));
        let (umask_bits, credentials) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "invalid daemon settings");
                return false;
            }
        };

        // SAFETY: the child branch only runs detach(), which never returns
        match unsafe { fork() } {
            Err(errno) => {
                let e = HerdError::Daemon {
                    step: "fork #1".into(),
                    message: errno.desc().into(),
                };
                error!(error = %e, "cannot daemonize");
                false
            }
            Ok(ForkResult::Child) => self.detach(workload, umask_bits, credentials),
            Ok(ForkResult::Parent { child }) => {
                // the session leader exits as soon as it has forked the daemon
                if let Ok(WaitStatus::Exited(_, code)) = waitpid(child, None) {
                    if code != 0 {
                        error!(code, "daemon setup failed");
                        return false;
                    }
                }

                let running = self.timings.daemon_start_probe.wait_for(|| self.is_running());
                if running {
                    info!(pid = ?self.pid(), "daemon started");
                } else {
                    error!("daemon not observed running");
                }
                running
            }
        }
    }

    fn credentials(&self) -> Result<Credentials> {
        let gid = match &self.config.gid {
            None => None,
            Some(Principal::Id(id)) => Some(Gid::from_raw(*id)),
            Some(Principal::Name(name)) => Some(
                Group::from_name(name)
                    .ok()
                    .flatten()
                    .map(|group| group.gid)
                    .ok_or_else(|| HerdError::config_value("gid", format!("unknown group {name:?}")))?,
            ),
        };
        let uid = match &self.config.uid {
            None => None,
            Some(Principal::Id(id)) => Some(Uid::from_raw(*id)),
            Some(Principal::Name(name)) => Some(
                User::from_name(name)
                    .ok()
                    .flatten()
                    .map(|user| user.uid)
                    .ok_or_else(|| HerdError::config_value("uid", format!("unknown user {name:?}")))?,
            ),
        };
        Ok(Credentials { gid, uid })
    }

    /// Session leader side of the double fork, then the daemon itself.
    fn detach<F>(&self, workload: F, umask_bits: Option<u32>, credentials: Credentials) -> !
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        if let Err(e) = self.enter_session(umask_bits) {
            error!(error = %e, "environment setup failed");
            exit_now(exit_code::SETUP);
        }

        // SAFETY: the parent branch exits immediately
        match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => exit_now(0),
            Ok(ForkResult::Child) => {}
            Err(errno) => {
                error!(%errno, "fork #2 failed");
                exit_now(exit_code::SECOND_FORK);
            }
        }

        set_process_title(&self.name);

        if let Err(e) = self.redirect_streams() {
            error!(error = %e, "stream redirection failed");
            exit_now(exit_code::REDIRECT);
        }

        let pid = getpid();
        if let Err(e) = self.pid_file.write(pid) {
            error!(error = %e, "cannot record pid");
            exit_now(exit_code::PID_FILE);
        }

        if let Err(e) = drop_privileges(credentials) {
            error!(error = %e, "cannot drop privileges");
            let _ = self.pid_file.remove();
            exit_now(exit_code::PRIVILEGES);
        }

        info!(%pid, daemon = %self.name, "daemon running");
        let code = match panic::catch_unwind(AssertUnwindSafe(workload)) {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                error!(error = %format!("{e:#}"), "workload failed, stopping daemon");
                1
            }
            Err(_) => {
                error!("workload panicked, stopping daemon");
                1
            }
        };

        if let Err(e) = self.pid_file.remove_if_owned(pid) {
            warn!(error = %e, "pid file left behind");
        }
        exit_now(code)
    }

    fn enter_session(&self, umask_bits: Option<u32>) -> Result<()> {
        if let Some(dir) = &self.config.chdir {
            chdir(dir.as_path()).map_err(|errno| HerdError::Daemon {
                step: format!("chdir {}", dir.display()),
                message: errno.desc().into(),
            })?;
        }
        setsid().map_err(|errno| HerdError::Daemon {
            step: "setsid".into(),
            message: errno.desc().into(),
        })?;
        if let Some(bits) = umask_bits {
            umask(Mode::from_bits_truncate(bits as _));
        }
        Ok(())
    }

    /// Point stdin/stdout/stderr at the configured files, `/dev/null` otherwise.
    fn redirect_streams(&self) -> Result<()> {
        let null = Path::new("/dev/null");

        let stdin = open_stream(self.config.stdin.as_deref().unwrap_or(null), false)?;
        let stdout = open_stream(self.config.stdout.as_deref().unwrap_or(null), true)?;
        let stderr = open_stream(self.config.stderr.as_deref().unwrap_or(null), true)?;

        for (file, target) in [(&stdin, 0), (&stdout, 1), (&stderr, 2)] {
            dup2(file.as_raw_fd(), target).map_err(|errno| HerdError::Daemon {
                step: format!("dup2 onto fd {target}"),
                message: errno.desc().into(),
            })?;
        }
        Ok(())
    }

    /// Send `SIGTERM` and wait for the daemon to go away.
    ///
    /// A missing pid file means there is nothing to stop.
    #[instrument(level = "info", skip(self), fields(daemon = %self.name))]
    pub fn stop(&self) -> bool {
        let Some(raw) = self.pid() else {
            warn!("not started");
            return true;
        };
        let pid = Pid::from_raw(raw);

        match send_signal(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(e) if e.is_benign() => {
                info!(%pid, "already gone, clearing stale pid file");
                return self.clear_pid_file();
            }
            Err(e) => {
                error!(error = %e, "cannot signal daemon");
                return false;
            }
        }

        let budget = self.timings.daemon_stop_probe;
        if budget.wait_for(|| !process_exists(pid)) {
            info!(%pid, "daemon stopped");
            self.clear_pid_file()
        } else {
            let e = HerdError::StopTimeout {
                name: self.name.clone(),
                pid: raw,
                attempts: budget.attempts,
            };
            error!(error = %e, "daemon did not stop");
            false
        }
    }

    /// Stop, then start.
    pub fn restart<F>(&self, workload: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        self.stop() && self.start(workload)
    }

    fn clear_pid_file(&self) -> bool {
        match self.pid_file.remove() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "cannot remove pid file");
                false
            }
        }
    }
}

fn open_stream(path: &Path, write: bool) -> Result<File> {
    let opened = if write {
        OpenOptions::new().append(true).create(true).open(path)
    } else {
        File::open(path)
    };
    opened.map_err(|e| HerdError::io("opening redirect target", path, e))
}

/// Group first, while we still have the privilege to change it.
fn drop_privileges(credentials: Credentials) -> Result<()> {
    if let Some(gid) = credentials.gid {
        setgid(gid).map_err(|errno| HerdError::Daemon {
            step: format!("setgid {gid}"),
            message: errno.desc().into(),
        })?;
    }
    if let Some(uid) = credentials.uid {
        setuid(uid).map_err(|errno| HerdError::Daemon {
            step: format!("setuid {uid}"),
            message: errno.desc().into(),
        })?;
    }
    Ok(())
}
