// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Helpers for testing routers without a substrate.
//!
//! [`MockHal`] is a deterministic single core: it records every transfer and
//! credit the router issues so tests can act as the link peer. Writes that
//! target the core itself are applied, writes to other cores are only
//! recorded. With [`MockHal::loopback`] the Ethernet link is wired back onto
//! the same core so one router can exchange packets with itself.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use edm_track::entity::{Entity, toplevel};
use edm_track::tracker::{EntityManager, TextTracker, dev_null_tracker};
use edm_track::{Tracker, Writer};

use crate::hal::{EthTransport, Hal, LocalMemory, NocInterface, StreamRegisters};
use crate::layout::streams::NUM_STREAM_REGISTERS;
use crate::types::{CoreCoord, L1Addr, NocAddr, StreamId, TransactionId, TxqId};

pub const MOCK_L1_BYTES: usize = 512 * 1024;
const NUM_SCRATCH_REGISTERS: usize = 8;

pub type NocWrite = (L1Addr, NocAddr, usize, Option<TransactionId>);

pub struct MockHal {
    core: CoreCoord,
    l1: RefCell<Vec<u8>>,
    counters: RefCell<[i32; NUM_STREAM_REGISTERS]>,
    scratch: RefCell<[u32; NUM_SCRATCH_REGISTERS]>,
    eth_loopback: bool,
    queue_busy: Cell<bool>,
    held: RefCell<HashSet<TransactionId>>,
    hold_new: Cell<bool>,
    context_switches: Cell<usize>,

    noc_writes: RefCell<Vec<NocWrite>>,
    noc_inline_writes: RefCell<Vec<(NocAddr, u32)>>,
    noc_atomic_incs: RefCell<Vec<(NocAddr, u32)>>,
    noc_stream_increments: RefCell<Vec<(CoreCoord, StreamId, i32)>>,
    remote_increments: RefCell<Vec<(TxqId, StreamId, i32)>>,
    sent_bytes: RefCell<Vec<(TxqId, L1Addr, L1Addr, usize)>>,
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new(CoreCoord::default(), false)
    }
}

impl MockHal {
    #[must_use]
    pub fn new(core: CoreCoord, eth_loopback: bool) -> Self {
        Self {
            core,
            l1: RefCell::new(vec![0; MOCK_L1_BYTES]),
            counters: RefCell::new([0; NUM_STREAM_REGISTERS]),
            scratch: RefCell::new([0; NUM_SCRATCH_REGISTERS]),
            eth_loopback,
            queue_busy: Cell::new(false),
            held: RefCell::new(HashSet::new()),
            hold_new: Cell::new(false),
            context_switches: Cell::new(0),
            noc_writes: RefCell::new(Vec::new()),
            noc_inline_writes: RefCell::new(Vec::new()),
            noc_atomic_incs: RefCell::new(Vec::new()),
            noc_stream_increments: RefCell::new(Vec::new()),
            remote_increments: RefCell::new(Vec::new()),
            sent_bytes: RefCell::new(Vec::new()),
        }
    }

    /// A core whose Ethernet link leads back to itself.
    #[must_use]
    pub fn loopback() -> Self {
        Self::new(CoreCoord::default(), true)
    }

    /// Keep writes issued with `trid` in flight until released.
    pub fn hold_transaction(&self, trid: TransactionId) {
        self.held.borrow_mut().insert(trid);
    }

    pub fn release_transaction(&self, trid: TransactionId) {
        self.held.borrow_mut().remove(&trid);
    }

    /// Hold every transaction id used by later writes.
    pub fn hold_new_transactions(&self, hold: bool) {
        self.hold_new.set(hold);
    }

    pub fn set_queue_busy(&self, busy: bool) {
        self.queue_busy.set(busy);
    }

    #[must_use]
    pub fn context_switches(&self) -> usize {
        self.context_switches.get()
    }

    #[must_use]
    pub fn noc_writes(&self) -> Vec<NocWrite> {
        self.noc_writes.borrow().clone()
    }

    #[must_use]
    pub fn noc_inline_writes(&self) -> Vec<(NocAddr, u32)> {
        self.noc_inline_writes.borrow().clone()
    }

    #[must_use]
    pub fn noc_atomic_incs(&self) -> Vec<(NocAddr, u32)> {
        self.noc_atomic_incs.borrow().clone()
    }

    #[must_use]
    pub fn noc_stream_increments(&self) -> Vec<(CoreCoord, StreamId, i32)> {
        self.noc_stream_increments.borrow().clone()
    }

    #[must_use]
    pub fn remote_increments(&self) -> Vec<(TxqId, StreamId, i32)> {
        self.remote_increments.borrow().clone()
    }

    #[must_use]
    pub fn sent_bytes(&self) -> Vec<(TxqId, L1Addr, L1Addr, usize)> {
        self.sent_bytes.borrow().clone()
    }

    fn copy_within(&self, src: L1Addr, dest: L1Addr, length: usize) {
        let (src, dest) = (src as usize, dest as usize);
        self.l1.borrow_mut().copy_within(src..src + length, dest);
    }

    fn read_word(&self, addr: L1Addr) -> u32 {
        let mut buf = [0u8; 4];
        self.read_l1(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn is_me(&self, core: CoreCoord) -> bool {
        core == self.core
    }
}

impl LocalMemory for MockHal {
    fn read_l1(&self, addr: L1Addr, buf: &mut [u8]) {
        let start = addr as usize;
        buf.copy_from_slice(&self.l1.borrow()[start..start + buf.len()]);
    }

    fn write_l1(&self, addr: L1Addr, data: &[u8]) {
        let start = addr as usize;
        self.l1.borrow_mut()[start..start + data.len()].copy_from_slice(data);
    }

    fn invalidate_local_view(&self) {}
}

impl StreamRegisters for MockHal {
    fn read_counter(&self, id: StreamId) -> i32 {
        self.counters.borrow()[id.0 as usize]
    }

    fn increment_local(&self, id: StreamId, delta: i32) {
        let mut counters = self.counters.borrow_mut();
        let counter = &mut counters[id.0 as usize];
        *counter = counter.wrapping_add(delta);
    }

    fn init_counter(&self, id: StreamId, value: i32) {
        self.counters.borrow_mut()[id.0 as usize] = value;
    }

    fn read_scratch(&self, index: usize) -> u32 {
        self.scratch.borrow()[index]
    }

    fn write_scratch(&self, index: usize, value: u32) {
        self.scratch.borrow_mut()[index] = value;
    }
}

impl EthTransport for MockHal {
    fn queue_is_busy(&self, _queue: TxqId) -> bool {
        self.queue_busy.get()
    }

    fn send_bytes(&self, queue: TxqId, src: L1Addr, dest: L1Addr, length: usize) {
        self.sent_bytes
            .borrow_mut()
            .push((queue, src, dest, length));
        if self.eth_loopback {
            self.copy_within(src, dest, length);
        }
    }

    fn increment_remote(&self, queue: TxqId, id: StreamId, delta: i32) {
        self.remote_increments.borrow_mut().push((queue, id, delta));
        if self.eth_loopback {
            self.increment_local(id, delta);
        }
    }
}

impl NocInterface for MockHal {
    fn my_core(&self) -> CoreCoord {
        self.core
    }

    fn noc_write(&self, src: L1Addr, dest: NocAddr, length: usize, trid: Option<TransactionId>) {
        self.noc_writes.borrow_mut().push((src, dest, length, trid));
        if let Some(trid) = trid {
            if self.hold_new.get() {
                self.hold_transaction(trid);
            }
        }
        if self.is_me(dest.core) {
            self.copy_within(src, dest.addr, length);
        }
    }

    fn noc_inline_write(&self, dest: NocAddr, value: u32) {
        self.noc_inline_writes.borrow_mut().push((dest, value));
        if self.is_me(dest.core) {
            self.write_l1(dest.addr, &value.to_le_bytes());
        }
    }

    fn noc_atomic_inc(&self, dest: NocAddr, increment: u32) {
        self.noc_atomic_incs.borrow_mut().push((dest, increment));
        if self.is_me(dest.core) {
            let value = self.read_word(dest.addr).wrapping_add(increment);
            self.write_l1(dest.addr, &value.to_le_bytes());
        }
    }

    fn noc_read(&self, src: NocAddr, dest: L1Addr, length: usize) {
        self.copy_within(src.addr, dest, length);
    }

    fn noc_increment_stream_register(&self, core: CoreCoord, id: StreamId, delta: i32) {
        self.noc_stream_increments
            .borrow_mut()
            .push((core, id, delta));
        if self.is_me(core) {
            self.increment_local(id, delta);
        }
    }

    fn transaction_flushed(&self, trid: TransactionId) -> bool {
        !self.held.borrow().contains(&trid)
    }

    fn write_barrier(&self) {}
}

impl Hal for MockHal {
    fn context_switch(&self) {
        self.context_switches.set(self.context_switches.get() + 1);
    }
}

/// An entity whose events are discarded.
#[must_use]
pub fn test_entity() -> Arc<Entity> {
    toplevel(&dev_null_tracker(), "test")
}

/// Create a [`Tracker`] writing every event of a test file to
/// `traces/<file>.txt`.
pub fn create_tracker(full_filepath: &str) -> Tracker {
    const FOLDER: &str = "traces";
    fs::create_dir_all(FOLDER).unwrap();

    let filename_only = Path::new(full_filepath)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap();
    let writer: Writer = Box::new(BufWriter::new(
        fs::File::create(format!("{FOLDER}/{filename_only}.txt")).unwrap(),
    ));
    let tracker: Tracker = Arc::new(TextTracker::new(
        EntityManager::new(log::Level::Trace),
        writer,
    ));
    tracker
}

/// The top entity of a test whose events are kept in a trace file.
#[must_use]
pub fn start_test(full_filepath: &str) -> Arc<Entity> {
    toplevel(&create_tracker(full_filepath), "top")
}
