// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Run traffic over a fabric with every router and worker on its own thread.
//!
//! The host side of a run follows the order the routers expect:
//!
//!  1. Initialize every router before any of them starts, so no handshake
//!     lands on a core that is yet to be reset.
//!  2. Start the routers and wait for all of them to finish their link and
//!     local handshakes.
//!  3. Release each chip's local master with `READY_FOR_TRAFFIC`.
//!  4. Start the workers and wait for every packet to arrive at its sinks.
//!  5. Ask every router to terminate gracefully and collect its telemetry.
//!
//! A fabric that stops making progress is given up on after the run's
//! timeout: the routers are told to terminate immediately and the run
//! returns an error without waiting for threads that may never finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use edm_fabric::config::RouterConfig;
use edm_fabric::fabric_error;
use edm_fabric::layout::{STATUS_ADDR, TERMINATION_SIGNAL_ADDR};
use edm_fabric::telemetry::RouterTelemetry;
use edm_fabric::types::{EdmStatus, FabricError, FabricResult, TerminationSignal};
use edm_fabric::view::TypedView;
use edm_track::entity::Entity;
use edm_track::{error, info, value};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::chip::{SINK_CORE, SimCore, edm_core, injector_core};
use crate::fabric::{Fabric, FabricOptions};
use crate::hal::SimHal;
use crate::topology::Topology;
use crate::traffic::TrafficPattern;
use crate::worker::{Flow, SinkLayout, Worker, payload_pattern};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What traffic to run and for how long.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub pattern: TrafficPattern,
    pub num_packets: usize,
    pub payload_bytes: usize,
    pub timeout_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            pattern: TrafficPattern::default(),
            num_packets: 32,
            payload_bytes: 256,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FabricReport {
    /// Telemetry of each router, by entity name.
    pub routers: Vec<(String, RouterTelemetry)>,
    pub flows: usize,
    pub packets_sent: usize,
    /// Packets written at a sink, a multicast packet counts once per
    /// destination.
    pub packets_delivered: usize,
    pub bytes_delivered: usize,
    pub elapsed: Duration,
}

type RouterHandle = JoinHandle<FabricResult<(String, RouterTelemetry)>>;
type WorkerHandle = JoinHandle<FabricResult<usize>>;

pub struct FabricRun {
    entity: Arc<Entity>,
    fabric: Fabric,
    flows: Vec<Flow>,
    layout: SinkLayout,
    timeout: Duration,
}

impl FabricRun {
    pub fn new(
        parent: &Arc<Entity>,
        topology: Arc<dyn Topology>,
        config: RouterConfig,
        options: FabricOptions,
        settings: &RunSettings,
    ) -> FabricResult<Self> {
        let flows = settings.pattern.flows(
            topology.as_ref(),
            settings.num_packets,
            settings.payload_bytes,
        )?;
        let layout = SinkLayout::new(&flows)?;
        let options = FabricOptions {
            sink_bytes: options.sink_bytes.max(layout.size_bytes()),
            ..options
        };
        let fabric = Fabric::new(topology, config, options)?;
        let entity = Arc::new(Entity::new(parent, "run"));
        info!(entity ; "{} over a {}: {} flows", settings.pattern, fabric.topology(), flows.len());
        Ok(Self {
            entity,
            fabric,
            flows,
            layout,
            timeout: Duration::from_millis(settings.timeout_ms),
        })
    }

    #[must_use]
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    #[must_use]
    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// Packets the sinks will have received once the run is complete.
    #[must_use]
    pub fn expected_arrivals(&self) -> usize {
        self.flows
            .iter()
            .map(|f| f.num_packets * f.route.destinations.len())
            .sum()
    }

    /// Run the traffic. `progress` is called with the packets delivered so
    /// far and the number expected while waiting for arrivals.
    pub fn run(&self, mut progress: impl FnMut(usize, usize)) -> FabricResult<FabricReport> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let edm_cores = self.all_edm_cores()?;
        let chip_entities = self.fabric.chip_entities(&self.entity);

        let mut routers = self.fabric.build_routers(&chip_entities)?;
        for router in &mut routers {
            router.initialize();
        }
        let router_handles = routers
            .into_iter()
            .map(|mut router| {
                let name = router.entity.full_name();
                thread::Builder::new()
                    .name(router.entity.name.clone())
                    .spawn(move || router.run().map(|telemetry| (name, telemetry)))
            })
            .collect::<Result<Vec<RouterHandle>, _>>()?;

        self.wait_until(deadline, &edm_cores, "link and local handshakes", || {
            edm_cores.iter().all(|core| {
                status(core).is_ok_and(|s| s >= EdmStatus::LocalHandshakeComplete)
            })
        })?;
        for chip in 0..self.fabric.chips().len() {
            let master = self.fabric.local_master(chip)?;
            TypedView::at(STATUS_ADDR).write(&master.l1, &EdmStatus::ReadyForTraffic);
        }
        info!(self.entity ; "released {} routers", edm_cores.len());

        let mut workers = self.spawn_workers(&chip_entities)?;
        let expected = self.expected_arrivals();
        let mut packets_sent = 0;
        let mut last_delivered = usize::MAX;
        loop {
            let (finished, running): (Vec<_>, Vec<_>) =
                workers.into_iter().partition(JoinHandle::is_finished);
            workers = running;
            for handle in finished {
                match join(handle, "worker") {
                    Ok(sent) => packets_sent += sent,
                    Err(e) => return Err(self.abort(&edm_cores, e)),
                }
            }

            let delivered = self.delivered()?;
            if delivered != last_delivered {
                progress(delivered, expected);
                last_delivered = delivered;
            }
            if delivered >= expected && workers.is_empty() {
                break;
            }
            if Instant::now() > deadline {
                let e = FabricError(format!(
                    "{delivered} of {expected} packets delivered before timing out"
                ));
                return Err(self.abort(&edm_cores, e));
            }
            thread::sleep(POLL_INTERVAL);
        }

        for core in &edm_cores {
            TypedView::at(TERMINATION_SIGNAL_ADDR)
                .write(&core.l1, &TerminationSignal::GracefullyTerminate);
        }
        self.wait_until(deadline, &edm_cores, "graceful termination", || {
            router_handles.iter().all(JoinHandle::is_finished)
        })?;
        let routers = router_handles
            .into_iter()
            .map(|handle| join(handle, "router"))
            .collect::<FabricResult<Vec<_>>>()?;

        for core in &edm_cores {
            let status = status(core)?;
            if status != EdmStatus::Terminated {
                fabric_error!(format!("router on {:?} ended in {status:?}", core));
            }
        }
        let bytes_delivered = self.verify()?;
        let report = FabricReport {
            routers,
            flows: self.flows.len(),
            packets_sent,
            packets_delivered: expected,
            bytes_delivered,
            elapsed: start.elapsed(),
        };
        value!(self.entity ; "packets_delivered", report.packets_delivered);
        info!(self.entity ; "{} packets delivered in {:?}",
            report.packets_delivered, report.elapsed);
        Ok(report)
    }

    fn all_edm_cores(&self) -> FabricResult<Vec<Arc<SimCore>>> {
        let mut cores = Vec::new();
        for chip in 0..self.fabric.chips().len() {
            cores.extend(self.fabric.edm_cores(chip)?);
        }
        Ok(cores)
    }

    /// One worker per link that has flows to inject.
    fn spawn_workers(&self, chip_entities: &[Arc<Entity>]) -> FabricResult<Vec<WorkerHandle>> {
        let map = self.fabric.config().memory_map();
        let by_link = self
            .flows
            .iter()
            .map(|flow| ((flow.src, flow.route.direction), flow))
            .into_group_map();

        let mut handles = Vec::new();
        for ((src, direction), flows) in by_link {
            let chip = self.fabric.chip(src)?;
            let core = self.fabric.core(src, injector_core(direction))?;
            let parent = chip_entities
                .get(src)
                .ok_or_else(|| FabricError(format!("no entity for chip {src}")))?;
            let entity = Arc::new(Entity::new(parent, &format!("worker_{direction}")));
            let flows = flows
                .into_iter()
                .map(|flow| Ok((flow.clone(), self.layout.region(flow.id)?)))
                .collect::<FabricResult<Vec<_>>>()?;

            let hal = SimHal::new(
                entity.clone(),
                chip.clone(),
                core.clone(),
                None,
                self.fabric.options().flush_delay_polls,
            );
            let mut worker = Worker::new(entity, hal, map.endpoint(edm_core(direction), 0), flows);
            let handle = thread::Builder::new()
                .name(format!("chip{src}_worker_{direction}"))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Packets counted in by the sink semaphores.
    fn delivered(&self) -> FabricResult<usize> {
        let mut delivered = 0;
        for flow in &self.flows {
            let region = self.layout.region(flow.id)?;
            for dst in &flow.route.destinations {
                let sink = self.fabric.core(*dst, SINK_CORE)?;
                let count = TypedView::<u32>::at(region.semaphore).load(&sink.l1) as usize;
                delivered += count.min(flow.num_packets);
            }
        }
        Ok(delivered)
    }

    /// Check every byte that should have arrived, returning the number of
    /// bytes checked.
    fn verify(&self) -> FabricResult<usize> {
        let mut bytes = 0;
        for flow in &self.flows {
            let region = self.layout.region(flow.id)?;
            let expected: Vec<u8> = (0..flow.num_packets)
                .flat_map(|seq| payload_pattern(flow.id, seq, flow.payload_bytes))
                .collect();
            for dst in &flow.route.destinations {
                let sink = self.fabric.core(*dst, SINK_CORE)?;
                let arrived = TypedView::<u32>::at(region.semaphore).load(&sink.l1) as usize;
                if arrived != flow.num_packets {
                    fabric_error!(format!(
                        "flow {} delivered {arrived} of {} packets to chip {dst}",
                        flow.id, flow.num_packets
                    ));
                }
                let data = sink.l1.read_vec(region.data, expected.len())?;
                if let Some(offset) = data.iter().zip(&expected).position(|(a, b)| a != b) {
                    fabric_error!(format!(
                        "flow {} corrupted at chip {dst}: packet {} byte {}",
                        flow.id,
                        offset / flow.payload_bytes.max(1),
                        offset % flow.payload_bytes.max(1)
                    ));
                }
                bytes += data.len();
            }
        }
        Ok(bytes)
    }

    fn wait_until(
        &self,
        deadline: Instant,
        edm_cores: &[Arc<SimCore>],
        what: &str,
        mut done: impl FnMut() -> bool,
    ) -> FabricResult {
        while !done() {
            if Instant::now() > deadline {
                let stuck: HashMap<String, usize> = edm_cores
                    .iter()
                    .map(|core| match status(core) {
                        Ok(s) => format!("{s:?}"),
                        Err(_) => "unknown".to_string(),
                    })
                    .counts();
                let e = FabricError(format!(
                    "timed out waiting for {what}, router states {stuck:?}"
                ));
                return Err(self.abort(edm_cores, e));
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    /// Tell every router to leave its main loop at once.
    fn abort(&self, edm_cores: &[Arc<SimCore>], e: FabricError) -> FabricError {
        error!(self.entity ; "{e}");
        for core in edm_cores {
            TypedView::at(TERMINATION_SIGNAL_ADDR)
                .write(&core.l1, &TerminationSignal::ImmediatelyTerminate);
        }
        e
    }
}

fn status(core: &SimCore) -> FabricResult<EdmStatus> {
    TypedView::at(STATUS_ADDR).read(&core.l1)
}

fn join<T>(handle: JoinHandle<FabricResult<T>>, what: &str) -> FabricResult<T> {
    handle
        .join()
        .map_err(|_| FabricError(format!("{what} thread panicked")))?
}
