// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The producer side of a connection to a sender channel.
//!
//! [`FabricSender`] is used by workers to inject packets into a router and by
//! receiver channels to forward packets into the sender channels of the other
//! routers of their chip.

use crate::connection::{ConnectionKind, encode_core, record, semaphore};
use crate::counters::BufferIndex;
use crate::fabric_error;
use crate::hal::Hal;
use crate::header::{HEADER_SIZE_BYTES, PacketHeader};
use crate::layout::EdmEndpoint;
use crate::types::{FabricResult, L1Addr, NocAddr, StreamId, TransactionId};
use crate::view::TypedView;

/// L1 of a worker used by its connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerConnectionAddrs {
    /// Receives the router's read counter.
    pub read_counter_addr: L1Addr,
    /// Incremented by the router once a close request has been handled.
    pub teardown_semaphore_addr: L1Addr,
    /// Scratch space for the location record and packet headers.
    pub scratch_addr: L1Addr,
}

impl WorkerConnectionAddrs {
    /// L1 bytes needed from `read_counter_addr` for the three areas when laid
    /// out by [`WorkerConnectionAddrs::packed`].
    pub const SIZE_BYTES: usize = 16 + HEADER_SIZE_BYTES;

    /// The three areas packed from `base`.
    #[must_use]
    pub const fn packed(base: L1Addr) -> Self {
        Self {
            read_counter_addr: base,
            teardown_semaphore_addr: base + 4,
            scratch_addr: base + 16,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Mode {
    Transient(WorkerConnectionAddrs),
    /// Free slots of the downstream channel tracked in a local register.
    Persistent { free_slots: StreamId },
}

#[derive(Debug)]
pub struct FabricSender {
    endpoint: EdmEndpoint,
    mode: Mode,
    write_counter: u32,
    write_index: BufferIndex,
    connected: bool,
}

impl FabricSender {
    #[must_use]
    pub fn transient(endpoint: EdmEndpoint, addrs: WorkerConnectionAddrs) -> Self {
        Self {
            endpoint,
            mode: Mode::Transient(addrs),
            write_counter: 0,
            write_index: BufferIndex::default(),
            connected: false,
        }
    }

    /// A router to router connection. The router owning the sender keeps the
    /// free slots of the downstream channel in its `free_slots` register.
    #[must_use]
    pub fn persistent(endpoint: EdmEndpoint, free_slots: StreamId) -> Self {
        Self {
            endpoint,
            mode: Mode::Persistent { free_slots },
            write_counter: 0,
            write_index: BufferIndex::default(),
            connected: false,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &EdmEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        match self.mode {
            Mode::Transient(_) => ConnectionKind::Transient,
            Mode::Persistent { .. } => ConnectionKind::Persistent,
        }
    }

    fn write_record_word<H: Hal + ?Sized>(&self, hal: &H, offset: u32, value: u32) {
        hal.noc_inline_write(self.endpoint.location_field(offset), value);
    }

    /// Bind to the sender channel.
    ///
    /// A transient producer resumes from the write counter parked by the
    /// previous producer and the read counter left by the router.
    pub fn open<H: Hal + ?Sized>(&mut self, hal: &H) {
        let me = encode_core(hal.my_core());
        match self.mode {
            Mode::Transient(addrs) => {
                hal.noc_read(
                    self.endpoint.location_field(0),
                    addrs.scratch_addr,
                    record::SIZE_BYTES,
                );
                let word = |offset| TypedView::<u32>::at(addrs.scratch_addr + offset).load(hal);
                self.write_counter = word(record::PARKED_WRITE_COUNTER);
                self.write_index = BufferIndex(word(record::PARKED_BUFFER_INDEX) as u8);
                let read_counter = word(record::ROUTER_READ_COUNTER);
                TypedView::<u32>::at(addrs.read_counter_addr).store(hal, read_counter);
                TypedView::<u32>::at(addrs.teardown_semaphore_addr).store(hal, 0);

                self.write_record_word(hal, record::CORE, me);
                self.write_record_word(hal, record::KIND, ConnectionKind::Transient as u32);
                self.write_record_word(hal, record::READ_COUNTER_ADDR, addrs.read_counter_addr);
                self.write_record_word(
                    hal,
                    record::TEARDOWN_SEMAPHORE_ADDR,
                    addrs.teardown_semaphore_addr,
                );
            }
            Mode::Persistent { free_slots } => {
                self.write_record_word(hal, record::CORE, me);
                self.write_record_word(hal, record::KIND, ConnectionKind::Persistent as u32);
                self.write_record_word(hal, record::CREDIT_STREAM_ID, free_slots.0 as u32);
            }
        }
        hal.noc_inline_write(self.endpoint.semaphore(), semaphore::OPEN);
        self.connected = true;
    }

    /// Free slots of the downstream channel as last reported.
    pub fn free_slots<H: Hal + ?Sized>(&self, hal: &H) -> usize {
        match self.mode {
            Mode::Transient(addrs) => {
                hal.invalidate_local_view();
                let read_counter = TypedView::<u32>::at(addrs.read_counter_addr).load(hal);
                let used = self.write_counter.wrapping_sub(read_counter) as usize;
                self.endpoint.num_buffers.saturating_sub(used)
            }
            Mode::Persistent { free_slots } => hal.read_counter(free_slots).max(0) as usize,
        }
    }

    pub fn has_space<H: Hal + ?Sized>(&self, hal: &H) -> bool {
        self.free_slots(hal) > 0
    }

    /// Copy a packet held in local L1 into the next downstream slot.
    ///
    /// The caller must have checked [`FabricSender::has_space`].
    pub fn send_from<H: Hal + ?Sized>(
        &mut self,
        hal: &H,
        src: L1Addr,
        length: usize,
        trid: Option<TransactionId>,
    ) {
        let dest = self.endpoint.slot(self.write_index.get());
        hal.noc_write(src, dest, length, trid);
        self.commit(hal);
    }

    /// Build a packet from `header` and a payload already in local L1.
    pub fn send_packet<H: Hal + ?Sized>(
        &mut self,
        hal: &H,
        header: &PacketHeader,
        payload: L1Addr,
    ) -> FabricResult {
        let Mode::Transient(addrs) = self.mode else {
            fabric_error!("packets are only built by transient producers");
        };
        if header.packet_size_bytes() > self.endpoint.slot_size_bytes {
            fabric_error!(format!(
                "packet of {} bytes does not fit a {} byte slot",
                header.packet_size_bytes(),
                self.endpoint.slot_size_bytes
            ));
        }
        PacketHeader::view(addrs.scratch_addr).write(hal, header);
        let dest = self.endpoint.slot(self.write_index.get());
        hal.noc_write(addrs.scratch_addr, dest, HEADER_SIZE_BYTES, None);
        if header.payload_size > 0 {
            hal.noc_write(
                payload,
                dest.offset(HEADER_SIZE_BYTES as u32),
                header.payload_size as usize,
                None,
            );
        }
        self.commit(hal);
        Ok(())
    }

    fn commit<H: Hal + ?Sized>(&mut self, hal: &H) {
        hal.noc_increment_stream_register(self.endpoint.core, self.endpoint.free_slots_stream, -1);
        if let Mode::Persistent { free_slots } = self.mode {
            hal.increment_local(free_slots, -1);
        }
        self.write_counter = self.write_counter.wrapping_add(1);
        self.write_index = self.write_index.next(self.endpoint.num_buffers);
    }

    /// Ask the router to unbind, parking the write counter for the next
    /// producer. The router acknowledges through the teardown semaphore, see
    /// [`FabricSender::poll_closed`].
    pub fn start_close<H: Hal + ?Sized>(&mut self, hal: &H) -> FabricResult {
        if let Mode::Persistent { .. } = self.mode {
            fabric_error!("persistent connections are never closed");
        }
        if !self.connected {
            fabric_error!("close of a connection that is not open");
        }
        self.write_record_word(hal, record::PARKED_WRITE_COUNTER, self.write_counter);
        self.write_record_word(
            hal,
            record::PARKED_BUFFER_INDEX,
            self.write_index.0 as u32,
        );
        hal.noc_inline_write(self.endpoint.semaphore(), semaphore::CLOSE_REQUEST);
        Ok(())
    }

    /// Whether the router has handled the close request. Once it has, the
    /// final read counter is in place and the sender is disconnected.
    pub fn poll_closed<H: Hal + ?Sized>(&mut self, hal: &H) -> bool {
        let Mode::Transient(addrs) = self.mode else {
            return false;
        };
        if !self.connected {
            return true;
        }
        hal.invalidate_local_view();
        let teardown = TypedView::<u32>::at(addrs.teardown_semaphore_addr);
        if teardown.load(hal) == 0 {
            return false;
        }
        teardown.store(hal, 0);
        self.connected = false;
        true
    }

    /// Unbind from the sender channel, blocking until the router has handed
    /// back its final read counter.
    pub fn close<H: Hal + ?Sized>(&mut self, hal: &H) -> FabricResult {
        self.start_close(hal)?;
        while !self.poll_closed(hal) {
            hal.context_switch();
        }
        Ok(())
    }

    #[must_use]
    pub fn write_counter(&self) -> u32 {
        self.write_counter
    }

    /// Where the next packet will land.
    #[must_use]
    pub fn next_slot(&self) -> NocAddr {
        self.endpoint.slot(self.write_index.get())
    }
}
