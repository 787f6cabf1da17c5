//! Pool lifecycle and report protocol tests.
//!
//! All tests fork workers and install process-wide signal handlers, so they
//! run serially.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use herd_config::{PollBudget, ReportConfig, Timings};
use herd_core::Address;
use herd_pool::{Pool, PoolReport, PoolState};
use herd_worker::{Handler, HandlerError, Service};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::json;
use serial_test::serial;

#[derive(Default)]
struct Sleeper {
    stopped: AtomicBool,
}

impl Handler for Sleeper {
    fn start(&self) -> Result<(), HandlerError> {
        let deadline = Instant::now() + Duration::from_secs(30);
        while !self.stopped.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn report(&self) -> serde_json::Value {
        json!({"status": 100})
    }
}

/// Exits as soon as it starts.
struct Crasher;

impl Handler for Crasher {
    fn start(&self) -> Result<(), HandlerError> {
        Err(HandlerError::Exit(3))
    }

    fn stop(&self) {}

    fn report(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Takes longer to report than the supervisor waits.
#[derive(Default)]
struct Slow {
    inner: Sleeper,
}

impl Handler for Slow {
    fn start(&self) -> Result<(), HandlerError> {
        self.inner.start()
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn report(&self) -> serde_json::Value {
        thread::sleep(Duration::from_millis(800));
        self.inner.report()
    }
}

fn service(name: &str) -> Service {
    Service::new(name, Sleeper::default())
}

fn fast_pool() -> Pool {
    Pool::new().with_timings(Timings::fast())
}

fn free_address() -> Address {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    Address::from(probe.local_addr().unwrap())
}

/// Give fresh workers time to install their signal handlers.
fn settle() {
    thread::sleep(Duration::from_millis(150));
}

fn pids_of(pool: &mut Pool, service: &str) -> Vec<i32> {
    pool.instances()[service].iter().filter_map(|info| info.pid).collect()
}

#[test]
#[serial]
fn test_desired_counts() {
    let mut pool = fast_pool();
    pool.attach(service("idle"), 0);
    pool.attach(service("busy"), 3);

    assert!(pool.start());
    assert_eq!(pool.state(), PoolState::Running);

    let instances = pool.instances();
    assert!(instances["idle"].is_empty());
    assert_eq!(instances["busy"].len(), 3);
    assert_eq!(pool.instance_count(), 3);

    settle();
    assert!(pool.stop());
    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(pool.instance_count(), 0);
}

#[test]
#[serial]
fn test_abnormal_death_restarts_in_place() {
    let mut pool = fast_pool();
    pool.attach(service("web"), 2);
    assert!(pool.start());

    let before = pids_of(&mut pool, "web");
    kill(Pid::from_raw(before[0]), Signal::SIGKILL).unwrap();
    thread::sleep(Duration::from_millis(100));

    pool.handle_child_exit();

    let instances = pool.instances();
    assert_eq!(instances["web"].len(), 2);
    assert_eq!(instances["web"][0].name, "web-1");
    assert_ne!(instances["web"][0].pid, Some(before[0]));
    assert_eq!(instances["web"][1].pid, Some(before[1]));
    assert_eq!(pool.state(), PoolState::Running);

    settle();
    pool.stop();
}

#[test]
#[serial]
fn test_clean_exit_is_not_restarted() {
    let mut pool = fast_pool();
    pool.attach(service("web"), 2);
    assert!(pool.start());
    settle();

    let before = pids_of(&mut pool, "web");
    kill(Pid::from_raw(before[0]), Signal::SIGTERM).unwrap();
    thread::sleep(Duration::from_millis(200));

    pool.handle_child_exit();
    assert_eq!(pids_of(&mut pool, "web"), vec![before[1]]);
    assert_eq!(pool.state(), PoolState::Running);

    // the last instance leaving stops the pool
    kill(Pid::from_raw(before[1]), Signal::SIGTERM).unwrap();
    thread::sleep(Duration::from_millis(200));

    pool.handle_child_exit();
    assert_eq!(pool.instance_count(), 0);
    assert_eq!(pool.state(), PoolState::Stopped);
}

#[test]
#[serial]
fn test_failed_start_rolls_back() {
    let timings = Timings {
        start_probe: PollBudget::new(3, Duration::from_millis(200)),
        ..Timings::fast()
    };
    let mut pool = Pool::new().with_timings(timings);
    pool.attach(service("web"), 2);
    pool.attach(Service::new("broken", Crasher), 1);

    assert!(!pool.start());
    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(pool.instance_count(), 0);
    assert!(pool.instances()["web"].is_empty());
}

#[test]
#[serial]
fn test_collect_skips_slow_instance() {
    let report = ReportConfig {
        incoming: free_address(),
        outgoing: free_address(),
    };
    let incoming = report.incoming.clone();

    let mut pool = fast_pool().with_report(report);
    pool.attach(service("web"), 2);
    pool.attach(Service::new("slow", Slow::default()), 1);
    assert!(pool.start());
    settle();

    let collected = pool.collect_reports(&incoming);
    assert!(collected.success);
    assert_eq!(collected.instances_count, Some(3));

    let instances = collected.instances.unwrap();
    let mut names: Vec<_> = instances.keys().cloned().collect();
    names.sort();
    assert_eq!(names, ["web-1", "web-2"]);
    assert_eq!(instances["web-2"]["report"]["status"], 100);

    // the request still counts for the instance that missed the deadline
    assert_eq!(pool.instances()["slow"][0].reported_count, 1);

    pool.stop();
}

#[test]
#[serial]
fn test_stop_requested_before_serve() {
    let mut pool = fast_pool();
    pool.attach(service("web"), 1);

    pool.stop_handle().stop();
    pool.serve().unwrap();

    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(pool.instance_count(), 0);
}

#[test]
#[serial]
fn test_collect_without_report_address() {
    let mut pool = fast_pool();
    pool.attach(service("quiet"), 1);
    assert!(pool.start());

    let report = pool.collect_reports(&free_address());
    assert!(report.success);
    assert_eq!(report.instances_count, Some(1));
    assert!(report.instances.unwrap().is_empty());
    assert_eq!(pool.instances()["quiet"][0].reported_count, 0);

    settle();
    pool.stop();
}

#[test]
#[serial]
fn test_collect_fails_when_incoming_is_taken() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let incoming = Address::from(taken.local_addr().unwrap());

    let mut pool = fast_pool();
    let report = pool.collect_reports(&incoming);
    assert_eq!(report, PoolReport::failed());
    assert_eq!(report.to_json(), r#"{"success":false}"#);
}

#[test]
#[serial]
fn test_stop_handle_ends_blocking_serve() {
    let mut pool = fast_pool();
    pool.attach(service("web"), 1);

    let handle = pool.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        handle.stop();
    });

    pool.serve().unwrap();
    stopper.join().unwrap();

    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(pool.instance_count(), 0);
}

#[test]
#[serial]
fn test_sigterm_stops_serving_pool() {
    let mut pool = fast_pool();
    pool.attach(service("web"), 1);

    let signaller = thread::spawn(|| {
        thread::sleep(Duration::from_millis(300));
        kill(Pid::this(), Signal::SIGTERM).unwrap();
    });

    pool.serve_blocking().unwrap();
    signaller.join().unwrap();

    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(pool.instance_count(), 0);
}

#[test]
#[serial]
fn test_report_protocol() {
    let report = ReportConfig {
        incoming: free_address(),
        outgoing: free_address(),
    };
    let outgoing = report.outgoing.resolve().unwrap();

    let mut pool = fast_pool().with_report(report);
    pool.attach(service("web"), 3);
    pool.attach(service("spare"), 0);

    let handle = pool.stop_handle();
    let client = thread::spawn(move || {
        settle();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut stream = loop {
            match TcpStream::connect(outgoing) {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Err(e) => panic!("report socket never came up: {e}"),
            }
        };
        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();
        handle.stop();
        body
    });

    pool.serve().unwrap();
    let body = client.join().unwrap();

    let report: PoolReport = serde_json::from_str(&body).unwrap();
    assert!(report.success);
    assert_eq!(report.instances_count, Some(3));
    assert!(report.started_at.is_some());

    let instances = report.instances.unwrap();
    assert_eq!(instances.len(), 3);
    for name in ["web-1", "web-2", "web-3"] {
        let payload = &instances[name];
        assert_eq!(payload["name"], name);
        assert_eq!(payload["handler"], "Sleeper");
        assert_eq!(payload["report"]["status"], 100);
    }

    assert_eq!(pool.state(), PoolState::Stopped);
}
