//! A named handler and the live instances running it.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use herd_config::Timings;
use herd_core::Address;
use tracing::{debug, info};

use crate::handler::Handler;
use crate::instance::Instance;
use crate::types::{InstanceInfo, Lifecycle, LifecycleEvent};

/// Owner of every live instance of one handler.
///
/// Instances announce their own transitions; the service is the only place
/// that adds them to or removes them from the live set. Announcements are
/// applied before every query, so a stopped instance disappears from the next
/// listing.
pub struct Service {
    name: String,
    handler: Arc<dyn Handler>,
    report_address: Option<Address>,
    timings: Timings,
    close_fds: Vec<RawFd>,
    last_seq: u32,
    live: Vec<Instance>,
    /// Instances between announcements; emptied by every event batch
    pending: Vec<Instance>,
    events_tx: Sender<LifecycleEvent>,
    events_rx: Receiver<LifecycleEvent>,
}

impl Service {
    pub fn new(name: impl Into<String>, handler: impl Handler) -> Self {
        Self::from_arc(name, Arc::new(handler))
    }

    /// Share an already boxed handler.
    pub fn from_arc(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            name: name.into(),
            handler,
            report_address: None,
            timings: Timings::default(),
            close_fds: Vec::new(),
            last_seq: 0,
            live: Vec::new(),
            pending: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_report_address(mut self, address: Address) -> Self {
        self.report_address = Some(address);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report_address(&self) -> Option<&Address> {
        self.report_address.as_ref()
    }

    /// Applies to instances started afterwards.
    pub fn set_report_address(&mut self, address: Option<Address>) {
        self.report_address = address;
    }

    /// Applies to instances started afterwards.
    pub fn set_timings(&mut self, timings: Timings) {
        self.timings = timings;
    }

    /// Supervisor descriptors every worker of this service must close.
    pub fn set_close_fds(&mut self, fds: Vec<RawFd>) {
        for instance in &mut self.live {
            instance.set_close_fds(fds.clone());
        }
        self.close_fds = fds;
    }

    /// Start one more instance with the next sequence number.
    ///
    /// `None` when the instance did not come up; it is not registered.
    pub fn start(&mut self) -> Option<&mut Instance> {
        self.last_seq += 1;
        let seq = self.last_seq;

        let mut instance = Instance::new(&self.name, seq, Arc::clone(&self.handler))
            .with_report_address(self.report_address.clone())
            .with_timings(self.timings.clone())
            .with_lifecycle(self.events_tx.clone());
        instance.set_close_fds(self.close_fds.clone());

        let started = instance.start();
        self.pending.push(instance);
        self.apply_events();

        if !started {
            return None;
        }
        self.live.iter_mut().find(|instance| instance.seq() == seq)
    }

    /// Snapshot of the live instances.
    pub fn instances(&mut self) -> Vec<InstanceInfo> {
        self.apply_events();
        self.live.iter().map(Instance::info).collect()
    }

    /// Number of live instances.
    pub fn len(&mut self) -> usize {
        self.apply_events();
        self.live.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// The live instance with sequence number `seq`.
    pub fn instance_mut(&mut self, seq: u32) -> Option<&mut Instance> {
        self.apply_events();
        self.live.iter_mut().find(|instance| instance.seq() == seq)
    }

    /// All live instances, for stopping, reporting or death handling.
    pub fn live_instances_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.apply_events();
        self.live.iter_mut()
    }

    /// Stop every live instance. True when all of them stopped.
    pub fn stop_all(&mut self) -> bool {
        self.apply_events();
        let mut all_stopped = true;
        for instance in &mut self.live {
            all_stopped &= instance.stop();
        }
        self.apply_events();
        all_stopped
    }

    fn apply_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            debug!(service = %self.name, seq = event.seq, state = %event.state, "lifecycle event");
            match event.state {
                Lifecycle::Started => {
                    if let Some(pos) = self.pending.iter().position(|i| i.seq() == event.seq) {
                        let instance = self.pending.remove(pos);
                        info!(service = %self.name, instance = %instance.name(), "instance registered");
                        self.live.push(instance);
                    }
                }
                Lifecycle::Stopped => {
                    if let Some(pos) = self.live.iter().position(|i| i.seq() == event.seq) {
                        // parked until a later Started in this batch reclaims it
                        let instance = self.live.remove(pos);
                        self.pending.push(instance);
                    }
                }
            }
        }
        self.pending.clear();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("handler", &self.handler.name())
            .field("live", &self.live)
            .finish()
    }
}
