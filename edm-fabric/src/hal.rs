// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The primitive operations a router needs from the hardware it runs on.
//!
//! All methods take `&self`: registers and memories are shared with the
//! link peer, the NoC and other cores, so implementations use interior
//! mutability. Every primitive is non-blocking.

use crate::types::{CoreCoord, L1Addr, NocAddr, StreamId, TransactionId, TxqId};

/// The L1 memory of the core the router runs on.
pub trait LocalMemory {
    fn read_l1(&self, addr: L1Addr, buf: &mut [u8]);

    fn write_l1(&self, addr: L1Addr, data: &[u8]);

    /// Discard any cached copy of L1 so that fields just written by a peer are
    /// observed. Must be called before re-reading such fields.
    fn invalidate_local_view(&self);
}

/// Hardware counter registers of the core the router runs on.
pub trait StreamRegisters {
    fn read_counter(&self, id: StreamId) -> i32;

    fn increment_local(&self, id: StreamId, delta: i32);

    /// Overwrite a counter. Only used at router (re)initialization.
    fn init_counter(&self, id: StreamId, value: i32);

    fn read_scratch(&self, index: usize) -> u32;

    fn write_scratch(&self, index: usize, value: u32);
}

/// The Ethernet link to the peer router.
pub trait EthTransport {
    fn queue_is_busy(&self, queue: TxqId) -> bool;

    /// Copy `length` bytes from local L1 to the peer's L1.
    fn send_bytes(&self, queue: TxqId, src: L1Addr, dest: L1Addr, length: usize);

    /// Increment one of the peer's counter registers (fire-and-forget).
    ///
    /// Ordered after any `send_bytes` previously issued on the same queue.
    fn increment_remote(&self, queue: TxqId, id: StreamId, delta: i32);
}

/// The network on chip used to reach other cores of the same chip.
pub trait NocInterface {
    fn my_core(&self) -> CoreCoord;

    /// Asynchronous write of local L1 to another core. Completion of writes
    /// issued with a transaction id is observed with [`transaction_flushed`].
    ///
    /// [`transaction_flushed`]: NocInterface::transaction_flushed
    fn noc_write(&self, src: L1Addr, dest: NocAddr, length: usize, trid: Option<TransactionId>);

    /// Write a single 32-bit word to another core.
    fn noc_inline_write(&self, dest: NocAddr, value: u32);

    /// Atomically increment a 32-bit word on another core.
    fn noc_atomic_inc(&self, dest: NocAddr, increment: u32);

    /// Read from another core into local L1.
    fn noc_read(&self, src: NocAddr, dest: L1Addr, length: usize);

    /// Increment a counter register of another core.
    fn noc_increment_stream_register(&self, core: CoreCoord, id: StreamId, delta: i32);

    /// Whether all writes issued with `trid` have landed.
    fn transaction_flushed(&self, trid: TransactionId) -> bool;

    /// Wait until every write issued by this core has landed.
    fn write_barrier(&self);
}

/// Everything a router needs from its core.
pub trait Hal: LocalMemory + StreamRegisters + EthTransport + NocInterface {
    /// Give the lower priority background routine a chance to run.
    fn context_switch(&self);
}

/// Spin until the transmit queue can accept another request.
pub fn wait_for_txq<H: EthTransport + ?Sized>(hal: &H, queue: TxqId) {
    while hal.queue_is_busy(queue) {
        std::hint::spin_loop();
    }
}
