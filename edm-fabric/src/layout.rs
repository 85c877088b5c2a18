// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Where router state lives in L1 and in the stream registers.
//!
//! The map is a pure function of the channel geometry so that producers and
//! the host can compute the addresses of a router they connect to.

use serde::{Deserialize, Serialize};

use crate::direction::{Direction, NUM_DIRECTIONS};
use crate::types::{CoreCoord, L1Addr, NocAddr, StreamId};

pub const MAX_SENDER_CHANNELS: usize = 8;
pub const MAX_RECEIVER_CHANNELS: usize = 2;
pub const MAX_BUFFERS_PER_CHANNEL: usize = 64;

pub const STATUS_ADDR: L1Addr = 0x00;
pub const TERMINATION_SIGNAL_ADDR: L1Addr = 0x10;
/// Written by the peer handshake master.
pub const HANDSHAKE_ADDR: L1Addr = 0x20;
/// Written by the peer handshake subordinate.
pub const HANDSHAKE_ACK_ADDR: L1Addr = 0x30;
/// Source of the words sent during the handshake.
pub const HANDSHAKE_STAGING_ADDR: L1Addr = 0x40;
/// Counts local handshake notifications from the other EDMs of the chip.
pub const LOCAL_SYNC_ADDR: L1Addr = 0x50;
pub const TX_HEARTBEAT_ADDR: L1Addr = 0x60;
pub const RX_HEARTBEAT_ADDR: L1Addr = 0x64;

const CONNECTION_BASE: L1Addr = 0x100;
const CONNECTION_STRIDE: L1Addr = 0x40;
const LOCATION_RECORD_OFFSET: L1Addr = 0x10;
const BUFFER_BASE: L1Addr = 0x400;

/// Scratch register used by the barrier between two cores of one router.
pub const MULTI_CORE_BARRIER_SCRATCH: usize = 0;

/// Stream register assignment.
pub mod streams {
    use super::*;

    pub const NUM_STREAM_REGISTERS: usize = 40;

    /// Incremented by the peer sender once per packet sent to receiver `vc`.
    #[must_use]
    pub const fn to_receiver_pkts_sent(vc: usize) -> StreamId {
        StreamId(vc as u8)
    }

    /// Incremented by the peer receiver once per packet it acks.
    #[must_use]
    pub const fn to_sender_pkts_acked(channel: usize) -> StreamId {
        StreamId((MAX_RECEIVER_CHANNELS + channel) as u8)
    }

    /// Incremented by the peer receiver once per packet it completes.
    #[must_use]
    pub const fn to_sender_pkts_completed(channel: usize) -> StreamId {
        StreamId((MAX_RECEIVER_CHANNELS + MAX_SENDER_CHANNELS + channel) as u8)
    }

    /// Free slots of a local sender channel, decremented by the producer.
    #[must_use]
    pub const fn sender_free_slots(channel: usize) -> StreamId {
        StreamId((MAX_RECEIVER_CHANNELS + 2 * MAX_SENDER_CHANNELS + channel) as u8)
    }

    /// Free slots of the downstream sender channel a receiver forwards into.
    #[must_use]
    pub const fn downstream_free_slots(vc: usize, direction: Direction) -> StreamId {
        StreamId(
            (MAX_RECEIVER_CHANNELS
                + 3 * MAX_SENDER_CHANNELS
                + vc * NUM_DIRECTIONS
                + direction.index()) as u8,
        )
    }

    /// Free slots of the local relay a receiver delivers through.
    #[must_use]
    pub const fn local_relay_free_slots(vc: usize) -> StreamId {
        StreamId(
            (MAX_RECEIVER_CHANNELS
                + 3 * MAX_SENDER_CHANNELS
                + MAX_RECEIVER_CHANNELS * NUM_DIRECTIONS
                + vc) as u8,
        )
    }
}

/// Addresses of the buffers and connection state of one router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdmMemoryMap {
    slot_size_bytes: u32,
    sender_bases: Vec<L1Addr>,
    sender_num_buffers: Vec<usize>,
    receiver_bases: Vec<L1Addr>,
    receiver_num_buffers: Vec<usize>,
    end: L1Addr,
}

impl EdmMemoryMap {
    #[must_use]
    pub fn new(
        slot_size_bytes: usize,
        sender_num_buffers: &[usize],
        receiver_num_buffers: &[usize],
    ) -> Self {
        let slot_size_bytes = slot_size_bytes as u32;
        let mut next = BUFFER_BASE;
        let mut allocate = |num_buffers: &usize| {
            let base = next;
            next += *num_buffers as u32 * slot_size_bytes;
            base
        };
        let sender_bases = sender_num_buffers.iter().map(&mut allocate).collect();
        let receiver_bases = receiver_num_buffers.iter().map(&mut allocate).collect();
        Self {
            slot_size_bytes,
            sender_bases,
            sender_num_buffers: sender_num_buffers.to_vec(),
            receiver_bases,
            receiver_num_buffers: receiver_num_buffers.to_vec(),
            end: next,
        }
    }

    #[must_use]
    pub fn slot_size_bytes(&self) -> usize {
        self.slot_size_bytes as usize
    }

    #[must_use]
    pub fn sender_buffer_base(&self, channel: usize) -> L1Addr {
        self.sender_bases[channel]
    }

    #[must_use]
    pub fn sender_num_buffers(&self, channel: usize) -> usize {
        self.sender_num_buffers[channel]
    }

    #[must_use]
    pub fn receiver_buffer_base(&self, vc: usize) -> L1Addr {
        self.receiver_bases[vc]
    }

    #[must_use]
    pub fn receiver_num_buffers(&self, vc: usize) -> usize {
        self.receiver_num_buffers[vc]
    }

    #[must_use]
    pub fn num_sender_channels(&self) -> usize {
        self.sender_bases.len()
    }

    #[must_use]
    pub fn num_receiver_channels(&self) -> usize {
        self.receiver_bases.len()
    }

    /// Liveness semaphore of the connection to a sender channel.
    #[must_use]
    pub fn connection_semaphore(&self, channel: usize) -> L1Addr {
        CONNECTION_BASE + channel as u32 * CONNECTION_STRIDE
    }

    /// Start of the record describing the producer of a sender channel.
    #[must_use]
    pub fn producer_location(&self, channel: usize) -> L1Addr {
        self.connection_semaphore(channel) + LOCATION_RECORD_OFFSET
    }

    /// Bytes of L1 used by the router.
    #[must_use]
    pub fn l1_size(&self) -> usize {
        self.end as usize
    }

    /// What a producer needs to know to connect to a sender channel of the
    /// router running on `core`.
    #[must_use]
    pub fn endpoint(&self, core: CoreCoord, channel: usize) -> EdmEndpoint {
        EdmEndpoint {
            core,
            channel,
            buffer_base: self.sender_buffer_base(channel),
            num_buffers: self.sender_num_buffers(channel),
            slot_size_bytes: self.slot_size_bytes(),
            semaphore_addr: self.connection_semaphore(channel),
            location_addr: self.producer_location(channel),
            free_slots_stream: streams::sender_free_slots(channel),
        }
    }
}

/// The sender channel of a router as seen by a producer on another core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdmEndpoint {
    pub core: CoreCoord,
    pub channel: usize,
    pub buffer_base: L1Addr,
    pub num_buffers: usize,
    pub slot_size_bytes: usize,
    pub semaphore_addr: L1Addr,
    pub location_addr: L1Addr,
    pub free_slots_stream: StreamId,
}

impl EdmEndpoint {
    #[must_use]
    pub fn slot(&self, index: usize) -> NocAddr {
        NocAddr::new(
            self.core,
            self.buffer_base + (index * self.slot_size_bytes) as u32,
        )
    }

    #[must_use]
    pub fn semaphore(&self) -> NocAddr {
        NocAddr::new(self.core, self.semaphore_addr)
    }

    #[must_use]
    pub fn location_field(&self, offset: u32) -> NocAddr {
        NocAddr::new(self.core, self.location_addr + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_do_not_overlap() {
        let map = EdmMemoryMap::new(256, &[4, 8], &[6]);
        assert_eq!(map.sender_buffer_base(0), BUFFER_BASE);
        assert_eq!(map.sender_buffer_base(1), BUFFER_BASE + 4 * 256);
        assert_eq!(map.receiver_buffer_base(0), BUFFER_BASE + 12 * 256);
        assert_eq!(map.l1_size(), (BUFFER_BASE + 18 * 256) as usize);
    }

    #[test]
    fn connection_records_fit_below_buffers() {
        let map = EdmMemoryMap::new(256, &[1; MAX_SENDER_CHANNELS], &[1]);
        let last = map.producer_location(MAX_SENDER_CHANNELS - 1);
        assert!(last + CONNECTION_STRIDE - LOCATION_RECORD_OFFSET <= BUFFER_BASE);
    }

    #[test]
    fn endpoint_addresses() {
        let map = EdmMemoryMap::new(256, &[4, 8], &[6]);
        let endpoint = map.endpoint(CoreCoord::new(2, 0), 1);
        assert_eq!(endpoint.slot(2).addr, BUFFER_BASE + 6 * 256);
        assert_eq!(endpoint.semaphore().addr, map.connection_semaphore(1));
        assert_eq!(endpoint.free_slots_stream, streams::sender_free_slots(1));
    }

    #[test]
    fn stream_registers_are_distinct() {
        let mut ids = Vec::new();
        for vc in 0..MAX_RECEIVER_CHANNELS {
            ids.push(streams::to_receiver_pkts_sent(vc));
            ids.push(streams::local_relay_free_slots(vc));
            for d in Direction::ALL {
                ids.push(streams::downstream_free_slots(vc, d));
            }
        }
        for ch in 0..MAX_SENDER_CHANNELS {
            ids.push(streams::to_sender_pkts_acked(ch));
            ids.push(streams::to_sender_pkts_completed(ch));
            ids.push(streams::sender_free_slots(ch));
        }
        let mut sorted: Vec<u8> = ids.iter().map(|id| id.0).collect();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
        assert!(
            sorted
                .iter()
                .all(|id| (*id as usize) < streams::NUM_STREAM_REGISTERS)
        );
    }
}
