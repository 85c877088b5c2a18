// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Workers inject traffic into the router of their link and the sink of each
//! chip receives it.
//!
//! Every flow owns a region of the sink of each of its destinations: an
//! arrival semaphore incremented once per packet and a data area written
//! packet by packet. A worker opens a connection for each of its flows,
//! sends the flow and closes the connection again so the next flow (or the
//! next worker) resumes where it left off.

use std::ops::Range;
use std::sync::Arc;

use edm_fabric::adapter::{FabricSender, WorkerConnectionAddrs};
use edm_fabric::fabric_error;
use edm_fabric::hal::{Hal, LocalMemory, NocInterface};
use edm_fabric::header::{HEADER_SIZE_BYTES, NocCommand, PacketHeader};
use edm_fabric::layout::EdmEndpoint;
use edm_fabric::types::{FabricError, FabricResult, L1Addr, NocAddr};
use edm_track::entity::Entity;
use edm_track::{debug, trace};

use crate::chip::SINK_CORE;
use crate::hal::SimHal;
use crate::topology::Route;

/// Connection state of the worker.
pub const CONNECTION_ADDR: L1Addr = 0x0;
/// Where each payload is built before being sent.
pub const STAGING_ADDR: L1Addr = 0x100;

/// Arrival semaphores, one word per flow.
pub const SINK_SEMAPHORE_ADDR: L1Addr = 0x0;
/// Start of the flows' data areas.
pub const SINK_DATA_ADDR: L1Addr = 0x1000;

/// One stream of packets from a chip to its destinations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flow {
    pub id: usize,
    pub src: usize,
    pub route: Route,
    pub num_packets: usize,
    pub payload_bytes: usize,
}

impl Flow {
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.num_packets * self.payload_bytes
    }
}

/// The bytes packet `seq` of flow `flow` carries.
#[must_use]
pub fn payload_pattern(flow: usize, seq: usize, length: usize) -> Vec<u8> {
    (0..length)
        .map(|i| (flow.wrapping_mul(31) ^ seq.wrapping_mul(7) ^ i) as u8)
        .collect()
}

/// Where a flow lands in a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkRegion {
    pub semaphore: L1Addr,
    pub data: L1Addr,
}

/// The regions of every flow in the sinks.
#[derive(Clone, Debug)]
pub struct SinkLayout {
    regions: Vec<SinkRegion>,
    end: usize,
}

impl SinkLayout {
    pub fn new(flows: &[Flow]) -> FabricResult<Self> {
        let max_flows = ((SINK_DATA_ADDR - SINK_SEMAPHORE_ADDR) / 4) as usize;
        if flows.len() > max_flows {
            fabric_error!(format!(
                "{} flows, the sink has semaphores for {max_flows}",
                flows.len()
            ));
        }
        let mut regions = Vec::with_capacity(flows.len());
        let mut next = SINK_DATA_ADDR as usize;
        for (index, flow) in flows.iter().enumerate() {
            if flow.id != index {
                fabric_error!(format!("flow {} listed at position {index}", flow.id));
            }
            let data = L1Addr::try_from(next)
                .map_err(|_| FabricError(format!("flow {} does not fit the sink", flow.id)))?;
            regions.push(SinkRegion {
                semaphore: SINK_SEMAPHORE_ADDR + 4 * index as L1Addr,
                data,
            });
            next += flow.size_bytes().next_multiple_of(16);
        }
        Ok(Self { regions, end: next })
    }

    pub fn region(&self, flow: usize) -> FabricResult<SinkRegion> {
        self.regions
            .get(flow)
            .copied()
            .ok_or_else(|| FabricError(format!("no sink region for flow {flow}")))
    }

    /// Bytes of sink L1 needed by all flows.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.end
    }

    #[must_use]
    pub fn data_range(&self, flow: &Flow) -> Option<Range<usize>> {
        let region = self.regions.get(flow.id)?;
        let start = region.data as usize;
        Some(start..start + flow.size_bytes())
    }
}

/// A worker core injecting the flows of one link of its chip.
pub struct Worker {
    pub entity: Arc<Entity>,
    hal: SimHal,
    sender: FabricSender,
    flows: Vec<(Flow, SinkRegion)>,
}

impl Worker {
    #[must_use]
    pub fn new(
        entity: Arc<Entity>,
        hal: SimHal,
        router: EdmEndpoint,
        flows: Vec<(Flow, SinkRegion)>,
    ) -> Self {
        let sender =
            FabricSender::transient(router, WorkerConnectionAddrs::packed(CONNECTION_ADDR));
        Self {
            entity,
            hal,
            sender,
            flows,
        }
    }

    /// Send every flow, returning the number of packets sent.
    pub fn run(&mut self) -> FabricResult<usize> {
        let mut sent = 0;
        for (flow, region) in &self.flows {
            let max_payload = self.sender.endpoint().slot_size_bytes - HEADER_SIZE_BYTES;
            if flow.payload_bytes > max_payload {
                fabric_error!(format!(
                    "flow {} packets of {} bytes exceed the {max_payload} byte payload",
                    flow.id, flow.payload_bytes
                ));
            }

            self.sender.open(&self.hal);
            debug!(self.entity ; "flow {} to {:?}", flow.id, flow.route.destinations);
            for seq in 0..flow.num_packets {
                let offset = (seq * flow.payload_bytes) as L1Addr;
                self.hal
                    .write_l1(STAGING_ADDR, &payload_pattern(flow.id, seq, flow.payload_bytes));
                let header = PacketHeader::new(
                    NocCommand::UnicastWriteAtomicInc {
                        dest: NocAddr::new(SINK_CORE, region.data + offset),
                        semaphore: NocAddr::new(SINK_CORE, region.semaphore),
                        increment: 1,
                    },
                    flow.payload_bytes,
                    flow.route.routing,
                );
                while !self.sender.has_space(&self.hal) {
                    self.hal.context_switch();
                }
                self.sender.send_packet(&self.hal, &header, STAGING_ADDR)?;
                trace!(self.entity ; "flow {} packet {seq}", flow.id);
                sent += 1;
            }
            self.sender.close(&self.hal)?;
        }
        debug!(self.entity ; "sent {sent} packets from {}", self.hal.my_core());
        Ok(sent)
    }
}
