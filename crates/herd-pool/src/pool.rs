//! The multi-service pool and its serve loops.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Local};
use herd_config::{PoolConfig, ReportConfig, Settings, Timings};
use herd_core::{Address, HerdError, Result, log_instance_event};
use herd_worker::{InstanceInfo, Service};
use signal_hook::iterator::Handle;
use tracing::{debug, error, info, instrument, warn};

use crate::report::{PoolReport, ReportCollector};
use crate::signals::{SupervisorSignal, SupervisorSignals};

/// Where a pool is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Asks a serving pool to stop from another thread.
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    wake: Arc<Mutex<Option<Handle>>>,
}

impl StopHandle {
    /// The pool stops all instances and `serve` returns shortly after.
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Ok(wake) = self.wake.lock() {
            if let Some(handle) = wake.as_ref() {
                handle.close();
            }
        }
    }
}

struct Member {
    service: Service,
    desired: usize,
}

/// A set of services, each kept at a desired instance count.
///
/// Instances that die abnormally are restarted in place. Instances that exit
/// with status 0 are dropped. When nothing is left alive the pool stops.
pub struct Pool {
    members: Vec<Member>,
    report: Option<ReportConfig>,
    timings: Timings,
    state: PoolState,
    started_at: Option<DateTime<Local>>,
    signals: Option<SupervisorSignals>,
    stop_requested: Arc<AtomicBool>,
    wake: Arc<Mutex<Option<Handle>>>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// A pool without report sockets.
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            report: None,
            timings: Timings::default(),
            state: PoolState::NotStarted,
            started_at: None,
            signals: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Mutex::new(None)),
        }
    }

    /// A pool using the report addresses and timings of `config`.
    ///
    /// `config.services` describe commands; attach them separately.
    pub fn from_config(config: &PoolConfig) -> Self {
        let mut pool = Self::new().with_timings(config.timings.clone());
        pool.report = config.report.clone();
        pool
    }

    /// A pool configured from the `namespace` section, defaults when absent.
    pub fn from_settings(settings: &Settings, namespace: &str) -> Result<Self> {
        let config: PoolConfig = settings.section(namespace)?.unwrap_or_default();
        if config.report.is_none() {
            debug!(namespace, "no report section configured");
        }
        Ok(Self::from_config(&config))
    }

    /// Timings for the pool and every service attached afterwards.
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_report(mut self, report: ReportConfig) -> Self {
        self.report = Some(report);
        self
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    /// True once a stop has begun.
    pub fn is_stopped(&self) -> bool {
        matches!(self.state, PoolState::Stopping | PoolState::Stopped)
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            requested: Arc::clone(&self.stop_requested),
            wake: Arc::clone(&self.wake),
        }
    }

    /// Register `service` to run `desired` instances once the pool starts.
    ///
    /// A desired count of zero registers the service without spawning it.
    pub fn attach(&mut self, mut service: Service, desired: usize) {
        service.set_timings(self.timings.clone());
        if let Some(report) = &self.report {
            service.set_report_address(Some(report.incoming.clone()));
        }
        if desired == 0 {
            info!(service = %service.name(), "service disabled");
        }
        self.members.push(Member { service, desired });
    }

    /// Live instances grouped by service name.
    pub fn instances(&mut self) -> BTreeMap<String, Vec<InstanceInfo>> {
        self.members
            .iter_mut()
            .map(|member| (member.service.name().to_string(), member.service.instances()))
            .collect()
    }

    /// Total live instances across services.
    pub fn instance_count(&mut self) -> usize {
        self.members.iter_mut().map(|member| member.service.len()).sum()
    }

    /// Start every service at its desired count.
    ///
    /// All or nothing: if any instance fails to come up, everything already
    /// started is stopped again.
    #[instrument(level = "info", skip(self))]
    pub fn start(&mut self) -> bool {
        self.state = PoolState::Running;
        self.started_at = Some(Local::now());

        if let Err(e) = self.install_signals() {
            error!(error = %e, "cannot watch supervisor signals");
            self.state = PoolState::Stopped;
            return false;
        }

        let mut failed = None;
        'members: for member in &mut self.members {
            for _ in 0..member.desired {
                if member.service.start().is_none() {
                    failed = Some(member.service.name().to_string());
                    break 'members;
                }
            }
        }

        if let Some(service) = failed {
            let e = HerdError::PoolStart {
                service,
                message: "instance did not come up".into(),
            };
            error!(error = %e, "rolling back pool start");
            self.stop();
            return false;
        }

        info!(instances = self.instance_count(), "pool started");
        true
    }

    fn install_signals(&mut self) -> Result<()> {
        if self.signals.as_ref().is_some_and(|signals| !signals.is_closed()) {
            return Ok(());
        }
        let signals = SupervisorSignals::install()?;
        if let Ok(mut wake) = self.wake.lock() {
            *wake = Some(signals.handle());
        }
        self.signals = Some(signals);
        Ok(())
    }

    /// Stop every live instance. Failures are logged; this always succeeds.
    #[instrument(level = "info", skip(self))]
    pub fn stop(&mut self) -> bool {
        self.state = PoolState::Stopping;
        for member in &mut self.members {
            if !member.service.stop_all() {
                warn!(service = %member.service.name(), "some instances did not stop");
            }
        }
        self.state = PoolState::Stopped;
        info!("pool stopped");
        true
    }

    /// Stop, then start. Clears any pending [`StopHandle`] request.
    pub fn restart(&mut self) -> bool {
        if !self.stop() {
            return false;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.start()
    }

    fn honour_stop_request(&mut self) {
        if self.stop_requested.load(Ordering::SeqCst) && !self.is_stopped() {
            info!("stop requested through handle");
            self.stop();
        }
    }

    /// React to child deaths.
    ///
    /// Exit status 0 retires the instance; anything else restarts it under the
    /// same name. Stops the pool when no instance is left alive.
    pub fn handle_child_exit(&mut self) {
        if self.is_stopped() {
            return;
        }

        for member in &mut self.members {
            for instance in member.service.live_instances_mut() {
                if instance.is_running() {
                    continue;
                }
                log_instance_event!(
                    instance.name(),
                    "died",
                    pid = ?instance.last_pid(),
                    exit_code = ?instance.exit_code()
                );

                if instance.exit_code() == Some(0) {
                    info!(instance = %instance.name(), "exited cleanly, not restarting");
                    instance.retire();
                } else if !instance.start() {
                    error!(instance = %instance.name(), "restart failed, dropping instance");
                    instance.retire();
                }
            }
        }

        let all_dead = self
            .members
            .iter_mut()
            .all(|member| member.service.live_instances_mut().all(|instance| !instance.is_running()));
        if all_dead {
            info!("no instance left alive, stopping pool");
            self.stop();
        }
    }

    fn dispatch(&mut self, received: Vec<SupervisorSignal>) {
        let mut child_exited = false;
        for signal in received {
            match signal {
                SupervisorSignal::ChildExited => child_exited = true,
                SupervisorSignal::Terminate(signo) => {
                    info!(signal = signo, "termination requested");
                    if !self.is_stopped() {
                        self.stop();
                    }
                }
            }
        }

        if child_exited {
            self.handle_child_exit();
        }
        self.honour_stop_request();
    }

    fn start_or_fail(&mut self) -> Result<()> {
        if self.start() {
            Ok(())
        } else {
            Err(HerdError::PoolStart {
                service: "pool".into(),
                message: "start rolled back".into(),
            })
        }
    }

    /// Serve with reports when a report section is configured, blocking otherwise.
    pub fn serve(&mut self) -> Result<()> {
        match self.report.clone() {
            Some(report) => self.serve_with_report(&report.outgoing, &report.incoming),
            None => self.serve_blocking(),
        }
    }

    /// Start the pool and handle signals until it stops.
    pub fn serve_blocking(&mut self) -> Result<()> {
        warn!("reporting disabled");
        self.start_or_fail()?;
        self.honour_stop_request();

        while !self.is_stopped() {
            let received = match self.signals.as_mut() {
                Some(signals) => signals.wait(),
                None => break,
            };
            self.dispatch(received);
        }
        Ok(())
    }

    /// Start the pool and answer every connection on `outgoing` with a fresh
    /// aggregate report, gathered through `incoming`, until it stops.
    pub fn serve_with_report(&mut self, outgoing: &Address, incoming: &Address) -> Result<()> {
        let target = outgoing.resolve()?;
        let listener = TcpListener::bind(target).map_err(|source| HerdError::Bind {
            address: outgoing.to_string(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| HerdError::socket("configure", outgoing, e))?;

        for member in &mut self.members {
            member.service.set_report_address(Some(incoming.clone()));
            member.service.set_close_fds(vec![listener.as_raw_fd()]);
        }

        info!(%outgoing, %incoming, "serving reports");
        self.start_or_fail()?;

        let tick = self.timings.serve_tick;
        while !self.is_stopped() {
            let received = self.signals.as_mut().map(SupervisorSignals::pending).unwrap_or_default();
            self.dispatch(received);
            if self.is_stopped() {
                break;
            }

            match listener.accept() {
                Ok((client, peer)) => self.answer(client, peer, incoming),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(tick),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "report socket is broken, stopping");
                    self.stop();
                    return Err(HerdError::socket("accept", outgoing, e));
                }
            }
        }
        Ok(())
    }

    fn answer(&mut self, mut client: TcpStream, peer: SocketAddr, incoming: &Address) {
        debug!(%peer, "report requested");
        let body = self.collect_reports(incoming).to_json();

        let delivered = client
            .set_nonblocking(false)
            .and_then(|()| client.set_write_timeout(Some(self.timings.report_accept_timeout)))
            .and_then(|()| client.write_all(body.as_bytes()));
        if let Err(e) = delivered {
            warn!(%peer, error = %e, "failed to deliver report");
        }
    }

    /// Ask every live instance for a report and gather the answers.
    ///
    /// Instances that do not answer in time are left out. Returns a failed
    /// report if the incoming address cannot be bound.
    pub fn collect_reports(&mut self, incoming: &Address) -> PoolReport {
        match self.try_collect_reports(incoming) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "failed to collect reports");
                PoolReport::failed()
            }
        }
    }

    fn try_collect_reports(&mut self, incoming: &Address) -> Result<PoolReport> {
        let collector = ReportCollector::bind(incoming, self.timings.report_accept_timeout)?;
        let started_at = self.started_at.unwrap_or_else(Local::now);
        let mut report = PoolReport::new(started_at, self.instance_count());

        for member in &mut self.members {
            for instance in member.service.live_instances_mut() {
                if !instance.report() {
                    continue;
                }
                match collector.receive(instance.name()) {
                    Ok(payload) => report.insert(instance.name(), payload),
                    Err(e) => error!(instance = %instance.name(), error = %e, "report not collected"),
                }
            }
        }
        Ok(report)
    }
}
