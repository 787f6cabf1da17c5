//! `start|stop|restart|status|pid` dispatch with process exit codes.

use std::fmt;
use std::str::FromStr;

use crossterm::style::Stylize;

use crate::daemon::Daemon;

/// Exit status for an unrecognised command.
pub const EXIT_USAGE: u8 = 2;

/// A daemon management command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaemonCommand {
    #[default]
    Start,
    Stop,
    Restart,
    Status,
    Pid,
}

impl DaemonCommand {
    pub const ALL: [DaemonCommand; 5] = [Self::Start, Self::Stop, Self::Restart, Self::Status, Self::Pid];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Status => "status",
            Self::Pid => "pid",
        }
    }
}

impl fmt::Display for DaemonCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unknown command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command {:?}, expected one of start, stop, restart, status, pid", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for DaemonCommand {
    type Err = UnknownCommand;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == raw)
            .ok_or_else(|| UnknownCommand(raw.to_string()))
    }
}

/// Parse `command` (default `start`) and run it. Unknown commands give [`EXIT_USAGE`].
pub fn dispatch<F>(daemon: &Daemon, command: Option<&str>, workload: F) -> u8
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match command.map_or(Ok(DaemonCommand::Start), str::parse::<DaemonCommand>) {
        Ok(command) => run(daemon, command, workload),
        Err(e) => {
            println!("{}", e.to_string().red());
            EXIT_USAGE
        }
    }
}

/// Run `command` against `daemon`, printing the outcome.
///
/// `start`, `stop` and `restart` give 1 on failure, 0 otherwise. `status` and
/// `pid` always give 0.
pub fn run<F>(daemon: &Daemon, command: DaemonCommand, workload: F) -> u8
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let name = daemon.name();
    match command {
        DaemonCommand::Start => {
            if !daemon.config().daemonise {
                println!("{}", "Daemonisation disabled".yellow());
                let finished = daemon.start(workload);
                return outcome(finished, || format!("{name} finished"), "start");
            }
            if daemon.is_running() {
                println!("{}", format!("{name} already running [{}]", pid_label(daemon)).yellow());
            }
            let started = daemon.start(workload);
            outcome(started, || format!("{name} started with pid {}", pid_label(daemon)), "start")
        }
        DaemonCommand::Stop => {
            if daemon.pid().is_none() {
                println!("{}", format!("{name} not started").yellow());
            }
            outcome(daemon.stop(), || format!("{name} stopped"), "stop")
        }
        DaemonCommand::Restart => {
            let restarted = daemon.restart(workload);
            outcome(restarted, || format!("{name} restarted with pid {}", pid_label(daemon)), "restart")
        }
        DaemonCommand::Status => {
            if daemon.is_running() {
                println!("{}", format!("{name} is running").green());
            } else {
                println!("{}", format!("{name} is down").yellow());
            }
            0
        }
        DaemonCommand::Pid => {
            match daemon.pid().filter(|_| daemon.is_running()) {
                Some(pid) => println!("{}", format!("{name} pid is {pid}").green()),
                None => println!("{}", format!("{name} is down").yellow()),
            }
            0
        }
    }
}

fn outcome(succeeded: bool, message: impl FnOnce() -> String, action: &str) -> u8 {
    if succeeded {
        println!("{}", message().green());
        0
    } else {
        println!("{}", format!("Service {action} FAIL").red());
        1
    }
}

fn pid_label(daemon: &Daemon) -> String {
    daemon
        .pid()
        .map_or_else(|| "-".to_string(), |pid| pid.to_string())
}
