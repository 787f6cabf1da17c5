//! Detached daemon lifecycle tests.

use std::thread;
use std::time::Duration;

use herd_config::{DaemonConfig, Timings};
use herd_daemon::Daemon;
use serial_test::serial;
use tempfile::TempDir;

fn detached(dir: &TempDir) -> Daemon {
    Daemon::new(
        "herd-daemon-test",
        DaemonConfig {
            daemonise: true,
            pid: Some(dir.path().join("herd-daemon-test.pid")),
            stderr: Some(dir.path().join("stderr.log")),
            ..Default::default()
        },
    )
    .with_timings(Timings::fast())
}

fn sleepy() -> anyhow::Result<()> {
    thread::sleep(Duration::from_secs(30));
    Ok(())
}

#[test]
#[serial]
fn test_start_and_stop() {
    let dir = TempDir::new().unwrap();
    let daemon = detached(&dir);
    assert!(!daemon.is_running());

    assert!(daemon.start(sleepy));
    assert!(daemon.is_running());
    assert!(daemon.pid_file().path().exists());
    assert_ne!(daemon.pid(), Some(std::process::id() as i32));

    // starting again is a no-op
    assert!(daemon.start(sleepy));

    assert!(daemon.stop());
    assert!(!daemon.is_running());
    assert!(!daemon.pid_file().path().exists());
}

#[test]
#[serial]
fn test_restart_replaces_process() {
    let dir = TempDir::new().unwrap();
    let daemon = detached(&dir);

    assert!(daemon.start(sleepy));
    let first = daemon.pid();

    assert!(daemon.restart(sleepy));
    assert!(daemon.is_running());
    assert_ne!(daemon.pid(), first);

    assert!(daemon.stop());
}

#[test]
#[serial]
fn test_stale_pid_file() {
    let dir = TempDir::new().unwrap();
    let daemon = detached(&dir);
    std::fs::write(daemon.pid_file().path(), "4194321").unwrap();

    assert!(!daemon.is_running());
    assert!(daemon.stop());
    assert!(!daemon.pid_file().path().exists());
}

#[test]
#[serial]
fn test_setup_failure_reported() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(
        "herd-daemon-test",
        DaemonConfig {
            daemonise: true,
            pid: Some(dir.path().join("never.pid")),
            chdir: Some(dir.path().join("missing")),
            ..Default::default()
        },
    )
    .with_timings(Timings::fast());

    assert!(!daemon.start(sleepy));
    assert!(!daemon.pid_file().path().exists());
}
