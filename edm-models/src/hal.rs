// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The hardware seen by one core of a simulated chip.
//!
//! Transfers are applied as soon as they are issued: a NoC write or an
//! Ethernet send has landed by the time the call returns. What is modelled
//! is completion tracking. A write issued with a transaction id is reported
//! as outstanding for `flush_delay_polls` polls of
//! [`NocInterface::transaction_flushed`], so the receiver channels see writes
//! in flight exactly as they would on hardware.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use edm_fabric::hal::{EthTransport, Hal, LocalMemory, NocInterface, StreamRegisters};
use edm_fabric::types::{
    CoreCoord, FabricError, FabricResult, L1Addr, NocAddr, StreamId, TransactionId, TxqId,
};
use edm_track::entity::Entity;
use edm_track::error;

use crate::chip::{Chip, SimCore};

/// The two router cores at either end of an Ethernet cable.
#[derive(Clone, Debug)]
pub struct EthernetLink {
    pub near: Arc<SimCore>,
    pub far: Arc<SimCore>,
}

impl EthernetLink {
    /// The link as seen from the far end.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            near: self.far.clone(),
            far: self.near.clone(),
        }
    }
}

pub struct SimHal {
    entity: Arc<Entity>,
    chip: Arc<Chip>,
    core: Arc<SimCore>,
    link: Option<EthernetLink>,
    flush_delay_polls: usize,
    outstanding: RefCell<HashMap<TransactionId, usize>>,
}

impl SimHal {
    #[must_use]
    pub fn new(
        entity: Arc<Entity>,
        chip: Arc<Chip>,
        core: Arc<SimCore>,
        link: Option<EthernetLink>,
        flush_delay_polls: usize,
    ) -> Self {
        Self {
            entity,
            chip,
            core,
            link,
            flush_delay_polls,
            outstanding: RefCell::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn core(&self) -> &Arc<SimCore> {
        &self.core
    }

    fn report(&self, result: FabricResult) {
        if let Err(e) = result {
            error!(self.entity ; "{e}");
        }
    }

    fn target(&self, core: CoreCoord) -> FabricResult<&Arc<SimCore>> {
        self.chip
            .core(core)
            .ok_or_else(|| FabricError(format!("no core {core} on {}", self.chip)))
    }

    fn peer(&self) -> FabricResult<&Arc<SimCore>> {
        self.link
            .as_ref()
            .map(|link| &link.far)
            .ok_or_else(|| FabricError(format!("core {} has no link", self.core.coord)))
    }

    fn copy_to(&self, target: &SimCore, src: L1Addr, dest: L1Addr, length: usize) -> FabricResult {
        let data = self.core.l1.read_vec(src, length)?;
        target.l1.write(dest, &data)
    }
}

impl LocalMemory for SimHal {
    fn read_l1(&self, addr: L1Addr, buf: &mut [u8]) {
        self.report(self.core.l1.read(addr, buf));
    }

    fn write_l1(&self, addr: L1Addr, data: &[u8]) {
        self.report(self.core.l1.write(addr, data));
    }

    fn invalidate_local_view(&self) {}
}

impl StreamRegisters for SimHal {
    fn read_counter(&self, id: StreamId) -> i32 {
        self.core.streams.read_counter(id)
    }

    fn increment_local(&self, id: StreamId, delta: i32) {
        self.core.streams.increment_local(id, delta);
    }

    fn init_counter(&self, id: StreamId, value: i32) {
        self.core.streams.init_counter(id, value);
    }

    fn read_scratch(&self, index: usize) -> u32 {
        self.core.streams.read_scratch(index)
    }

    fn write_scratch(&self, index: usize, value: u32) {
        self.core.streams.write_scratch(index, value);
    }
}

impl EthTransport for SimHal {
    fn queue_is_busy(&self, _queue: TxqId) -> bool {
        false
    }

    fn send_bytes(&self, _queue: TxqId, src: L1Addr, dest: L1Addr, length: usize) {
        let result = self
            .peer()
            .and_then(|peer| self.copy_to(peer, src, dest, length));
        self.report(result);
    }

    fn increment_remote(&self, _queue: TxqId, id: StreamId, delta: i32) {
        match self.peer() {
            Ok(peer) => peer.streams.increment_local(id, delta),
            Err(e) => self.report(Err(e)),
        }
    }
}

impl NocInterface for SimHal {
    fn my_core(&self) -> CoreCoord {
        self.core.coord
    }

    fn noc_write(&self, src: L1Addr, dest: NocAddr, length: usize, trid: Option<TransactionId>) {
        let result = self
            .target(dest.core)
            .and_then(|target| self.copy_to(target, src, dest.addr, length));
        self.report(result);
        if let Some(trid) = trid {
            if self.flush_delay_polls > 0 {
                self.outstanding
                    .borrow_mut()
                    .insert(trid, self.flush_delay_polls);
            }
        }
    }

    fn noc_inline_write(&self, dest: NocAddr, value: u32) {
        let result = self
            .target(dest.core)
            .and_then(|target| target.l1.write(dest.addr, &value.to_le_bytes()));
        self.report(result);
    }

    fn noc_atomic_inc(&self, dest: NocAddr, increment: u32) {
        let result = self
            .target(dest.core)
            .and_then(|target| target.l1.atomic_inc(dest.addr, increment))
            .map(|_| ());
        self.report(result);
    }

    fn noc_read(&self, src: NocAddr, dest: L1Addr, length: usize) {
        let result = self
            .target(src.core)
            .and_then(|source| source.l1.read_vec(src.addr, length))
            .and_then(|data| self.core.l1.write(dest, &data));
        self.report(result);
    }

    fn noc_increment_stream_register(&self, core: CoreCoord, id: StreamId, delta: i32) {
        match self.target(core) {
            Ok(target) => target.streams.increment_local(id, delta),
            Err(e) => self.report(Err(e)),
        }
    }

    fn transaction_flushed(&self, trid: TransactionId) -> bool {
        let mut outstanding = self.outstanding.borrow_mut();
        match outstanding.get_mut(&trid) {
            None => true,
            Some(polls) if *polls <= 1 => {
                outstanding.remove(&trid);
                true
            }
            Some(polls) => {
                *polls -= 1;
                false
            }
        }
    }

    fn write_barrier(&self) {
        self.outstanding.borrow_mut().clear();
    }
}

impl Hal for SimHal {
    fn context_switch(&self) {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use edm_fabric::test_helpers::test_entity;

    use super::*;

    fn chip_with(cores: &[CoreCoord]) -> Arc<Chip> {
        let mut chip = Chip::new(0);
        for coord in cores {
            chip.add_core(*coord, 4096);
        }
        Arc::new(chip)
    }

    #[test]
    fn writes_land_on_the_target_core() {
        let (a, b) = (CoreCoord::new(0, 0), CoreCoord::new(1, 0));
        let chip = chip_with(&[a, b]);
        let hal = SimHal::new(
            test_entity(),
            chip.clone(),
            chip.core(a).unwrap().clone(),
            None,
            0,
        );

        hal.write_l1(0x100, &[9; 8]);
        hal.noc_write(0x100, NocAddr::new(b, 0x200), 8, None);
        hal.noc_inline_write(NocAddr::new(b, 0x300), 7);
        hal.noc_atomic_inc(NocAddr::new(b, 0x300), 2);
        hal.noc_increment_stream_register(b, StreamId(4), 3);

        let target = chip.core(b).unwrap();
        assert_eq!(target.l1.read_vec(0x200, 8).unwrap(), vec![9; 8]);
        assert_eq!(target.l1.read_vec(0x300, 4).unwrap(), 9u32.to_le_bytes());
        assert_eq!(target.streams.read_counter(StreamId(4)), 3);

        hal.noc_read(NocAddr::new(b, 0x300), 0x400, 4);
        assert_eq!(chip.core(a).unwrap().l1.read_vec(0x400, 4).unwrap(), 9u32.to_le_bytes());
    }

    #[test]
    fn transactions_stay_outstanding_for_the_flush_delay() {
        let a = CoreCoord::new(0, 0);
        let chip = chip_with(&[a]);
        let hal = SimHal::new(
            test_entity(),
            chip.clone(),
            chip.core(a).unwrap().clone(),
            None,
            3,
        );
        let trid = TransactionId(2);
        hal.noc_write(0, NocAddr::new(a, 0x100), 4, Some(trid));
        assert!(!hal.transaction_flushed(trid));
        assert!(!hal.transaction_flushed(trid));
        assert!(hal.transaction_flushed(trid));
        assert!(hal.transaction_flushed(trid));

        hal.noc_write(0, NocAddr::new(a, 0x100), 4, Some(trid));
        hal.write_barrier();
        assert!(hal.transaction_flushed(trid));
    }

    #[test]
    fn ethernet_reaches_the_far_end() {
        let near = Arc::new(SimCore::new(CoreCoord::new(0, 0), 4096));
        let far = Arc::new(SimCore::new(CoreCoord::new(0, 0), 4096));
        let link = EthernetLink {
            near: near.clone(),
            far: far.clone(),
        };
        let hal = SimHal::new(
            test_entity(),
            Arc::new(Chip::new(0)),
            near.clone(),
            Some(link),
            0,
        );

        hal.write_l1(0x40, &[5; 16]);
        hal.send_bytes(TxqId(0), 0x40, 0x80, 16);
        hal.increment_remote(TxqId(0), StreamId(1), 2);
        assert_eq!(far.l1.read_vec(0x80, 16).unwrap(), vec![5; 16]);
        assert_eq!(far.streams.read_counter(StreamId(1)), 2);
        assert_eq!(near.streams.read_counter(StreamId(1)), 0);
    }

    #[test]
    fn missing_targets_are_dropped() {
        let a = CoreCoord::new(0, 0);
        let chip = chip_with(&[a]);
        let hal = SimHal::new(
            test_entity(),
            chip.clone(),
            chip.core(a).unwrap().clone(),
            None,
            0,
        );
        hal.noc_inline_write(NocAddr::new(CoreCoord::new(5, 5), 0), 1);
        hal.send_bytes(TxqId(0), 0, 0, 4);
        hal.increment_remote(TxqId(0), StreamId(0), 1);
        assert_eq!(hal.read_counter(StreamId(0)), 0);
    }
}
