//! Process control primitives shared by instances and daemons.
//!
//! Liveness is always re-verified with a zero-signal probe; nothing here trusts
//! a cached pid.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::error::{HerdError, Result};

/// Outcome of probing one of our own children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Still running (or stopped by job control)
    Alive,
    /// Reaped just now. `None` when it was killed by a signal.
    Exited(Option<i32>),
    /// No such process, or the pid now belongs to something that is not our child
    Gone,
}

/// Send `signal` to `pid`, classifying failures.
pub fn send_signal(pid: Pid, signal: Signal) -> Result<()> {
    kill(pid, signal).map_err(|errno| HerdError::signal(pid.as_raw(), signal.as_str(), errno))
}

/// Zero-signal probe combined with a non-blocking reap.
///
/// A zombie answers the zero signal, so the reap is what observes the exit.
/// A pid that is alive but not our child reports [`Probe::Alive`].
pub fn probe_child(pid: Pid) -> Result<Probe> {
    match kill(pid, None) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(Probe::Gone),
        Err(source) => {
            return Err(HerdError::Probe {
                pid: pid.as_raw(),
                source,
            });
        }
    }

    loop {
        return match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(Probe::Alive),
            Ok(WaitStatus::Exited(_, code)) => Ok(Probe::Exited(Some(code))),
            Ok(WaitStatus::Signaled(..)) => Ok(Probe::Exited(None)),
            Ok(_) => Ok(Probe::Alive),
            Err(Errno::EINTR) => continue,
            // the pid exists but is not our child, so it was reused
            Err(Errno::ECHILD) => Ok(Probe::Gone),
            Err(source) => Err(HerdError::Probe {
                pid: pid.as_raw(),
                source,
            }),
        };
    }
}

/// Terminate the calling process immediately, skipping destructors and atexit hooks.
///
/// The only safe way out of a forked child.
pub fn exit_now(code: i32) -> ! {
    // SAFETY: _exit(2) never returns and is async-signal-safe
    unsafe { nix::libc::_exit(code) }
}

/// Whether any process with this pid exists, for pids that are not our children.
///
/// `EPERM` means it exists but belongs to someone else. Zombies count as gone.
pub fn process_exists(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    // /proc/<pid>/stat: "<pid> (<comm>) <state> ..."; comm may contain ')'
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rfind(')')
                .and_then(|end| stat[end + 1..].split_whitespace().next().map(|s| s == "Z"))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: Pid) -> bool {
    false
}

/// Rename the calling process as shown by `ps`/`top`. Linux truncates to 15 bytes.
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        let title = crate::types::process_title(title);
        let truncated: String = title.chars().take(15).collect();
        if let Ok(name) = std::ffi::CString::new(truncated) {
            if let Err(errno) = nix::sys::prctl::set_name(&name) {
                tracing::debug!(%errno, "failed to set process title");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = title;
    }
}
