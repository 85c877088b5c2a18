// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The receiver channel: accepts packets from the link and delivers them
//! locally, forwards them to the other routers of the chip, or both.
//!
//! Four pointers walk the receive buffer in order:
//!  - `ack`: next slot the peer sender will fill (acked on arrival with
//!    first level ack, otherwise kept with `wr_sent`).
//!  - `wr_sent`: next slot to deliver / forward.
//!  - `wr_flush`: next slot whose writes have to land.
//!  - `completion`: next slot to hand back to the peer sender.

use std::sync::Arc;

use edm_track::entity::Entity;
use edm_track::{error, trace, warn};

use crate::adapter::FabricSender;
use crate::buffer::ChannelBuffer;
use crate::counters::{BufferIndex, ChannelCounter, CounterWord};
use crate::direction::{Direction, DirectionSet, NUM_DIRECTIONS};
use crate::hal::{Hal, wait_for_txq};
use crate::header::{HEADER_SIZE_BYTES, NocCommand, PacketHeader};
use crate::layout::streams;
use crate::routing::RouteTargets;
use crate::sender::ChannelStats;
use crate::trid::TransactionIdTracker;
use crate::types::{L1Addr, StreamId, TransactionId, TxqId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiverSettings {
    pub my_direction: Direction,
    pub first_level_ack: bool,
    /// Complete a slot as soon as its writes have landed.
    pub fuse_flush_and_completion: bool,
    /// Wait for the previous writes of a slot before reusing it.
    pub trid_flush_check: bool,
    pub txq: TxqId,
    pub spin_wait: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverChannelPointers<W: CounterWord> {
    pub ack: ChannelCounter<W>,
    pub wr_sent: ChannelCounter<W>,
    pub wr_flush: ChannelCounter<W>,
    pub completion: ChannelCounter<W>,
    src_ch_ids: Vec<u8>,
}

impl<W: CounterWord> ReceiverChannelPointers<W> {
    #[must_use]
    pub fn new(num_buffers: usize) -> Self {
        Self {
            ack: ChannelCounter::new(num_buffers),
            wr_sent: ChannelCounter::new(num_buffers),
            wr_flush: ChannelCounter::new(num_buffers),
            completion: ChannelCounter::new(num_buffers),
            src_ch_ids: vec![0; num_buffers],
        }
    }

    fn set_src_ch_id(&mut self, index: BufferIndex, src_ch_id: u8) {
        self.src_ch_ids[index.get()] = src_ch_id;
    }

    #[must_use]
    pub fn src_ch_id(&self, index: BufferIndex) -> u8 {
        self.src_ch_ids[index.get()]
    }
}

/// Where a receiver channel can send packets on its chip.
#[derive(Debug, Default)]
pub struct DownstreamSenders {
    /// Indexed by the direction of the downstream router.
    pub routers: [Option<FabricSender>; NUM_DIRECTIONS],
    /// Local deliveries go through the relay when one is configured.
    pub local_relay: Option<FabricSender>,
}

impl DownstreamSenders {
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FabricSender> {
        self.routers
            .iter_mut()
            .flatten()
            .chain(self.local_relay.iter_mut())
    }
}

pub struct ReceiverChannel<W: CounterWord = u32> {
    pub entity: Arc<Entity>,
    vc: usize,
    buffer: ChannelBuffer,
    pointers: ReceiverChannelPointers<W>,
    trids: TransactionIdTracker,
    downstream: DownstreamSenders,
    settings: ReceiverSettings,
    stats: ChannelStats,
    warned_missing: DirectionSet,
}

impl<W: CounterWord> ReceiverChannel<W> {
    #[must_use]
    pub fn new(
        parent: &Arc<Entity>,
        vc: usize,
        buffer: ChannelBuffer,
        trids: TransactionIdTracker,
        downstream: DownstreamSenders,
        settings: ReceiverSettings,
    ) -> Self {
        let num_buffers = buffer.num_buffers();
        Self {
            entity: Arc::new(Entity::new(parent, &format!("rx{vc}"))),
            vc,
            buffer,
            pointers: ReceiverChannelPointers::new(num_buffers),
            trids,
            downstream,
            settings,
            stats: ChannelStats::default(),
            warned_missing: DirectionSet::EMPTY,
        }
    }

    /// Reset the channel registers, including the free slot registers of
    /// its downstream connections.
    pub fn initialize<H: Hal + ?Sized>(&mut self, hal: &H) {
        hal.init_counter(streams::to_receiver_pkts_sent(self.vc), 0);
        for direction in Direction::ALL {
            if let Some(sender) = &self.downstream.routers[direction.index()] {
                hal.init_counter(
                    streams::downstream_free_slots(self.vc, direction),
                    sender.endpoint().num_buffers as i32,
                );
            }
        }
        if let Some(relay) = &self.downstream.local_relay {
            hal.init_counter(
                streams::local_relay_free_slots(self.vc),
                relay.endpoint().num_buffers as i32,
            );
        }
        self.pointers = ReceiverChannelPointers::new(self.buffer.num_buffers());
    }

    /// Connect to every downstream sender channel.
    pub fn open_downstream<H: Hal + ?Sized>(&mut self, hal: &H) {
        for sender in self.downstream.iter_mut() {
            sender.open(hal);
        }
    }

    #[must_use]
    pub fn vc(&self) -> usize {
        self.vc
    }

    #[must_use]
    pub fn pointers(&self) -> &ReceiverChannelPointers<W> {
        &self.pointers
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn all_transactions_flushed<H: Hal + ?Sized>(&self, hal: &H) -> bool {
        self.trids.all_flushed(hal)
    }

    /// Whether every packet received has been handed back to the sender.
    pub fn is_drained<H: Hal + ?Sized>(&self, hal: &H) -> bool {
        hal.read_counter(streams::to_receiver_pkts_sent(self.vc)) == 0
            && self.pointers.wr_sent.is_caught_up_to(&self.pointers.ack)
            && self.pointers.completion.is_caught_up_to(&self.pointers.wr_sent)
    }

    fn queue_ready<H: Hal + ?Sized>(&self, hal: &H) -> bool {
        self.settings.spin_wait || !hal.queue_is_busy(self.settings.txq)
    }

    fn send_credit<H: Hal + ?Sized>(&self, hal: &H, stream: StreamId) {
        if self.settings.spin_wait {
            wait_for_txq(hal, self.settings.txq);
        }
        hal.increment_remote(self.settings.txq, stream, 1);
    }

    /// Run one step, returning whether any progress was made.
    pub fn step<H: Hal + ?Sized>(&mut self, hal: &H) -> bool {
        hal.invalidate_local_view();
        let pkts_sent_stream = streams::to_receiver_pkts_sent(self.vc);
        let pkts_received = hal.read_counter(pkts_sent_stream);
        let mut progress = false;

        let unwritten = if self.settings.first_level_ack {
            if pkts_received > 0 && self.queue_ready(hal) {
                hal.increment_local(pkts_sent_stream, -1);
                let index = self.pointers.ack.buffer_index();
                let slot = self.buffer.slot_address(index);
                let src_ch_id = PacketHeader::src_ch_id_view(slot)
                    .read(hal)
                    .unwrap_or_default();
                self.pointers.set_src_ch_id(index, src_ch_id);
                self.send_credit(hal, streams::to_sender_pkts_acked(src_ch_id as usize));
                self.pointers.ack.increment();
                progress = true;
            }
            !self.pointers.wr_sent.is_caught_up_to(&self.pointers.ack)
        } else {
            pkts_received != 0
        };

        if unwritten {
            progress |= self.forward_next(hal);
        }

        progress |= if self.settings.fuse_flush_and_completion {
            self.flush_and_complete(hal)
        } else {
            self.flush(hal) | self.complete(hal)
        };
        progress
    }

    fn forward_next<H: Hal + ?Sized>(&mut self, hal: &H) -> bool {
        let index = self.pointers.wr_sent.buffer_index();
        let slot = self.buffer.slot_address(index);
        if !self.settings.first_level_ack {
            // Recorded before decoding so a dropped packet still completes to its source.
            let src_ch_id = PacketHeader::src_ch_id_view(slot)
                .read(hal)
                .unwrap_or_default();
            self.pointers.set_src_ch_id(index, src_ch_id);
        }
        let header = match PacketHeader::view(slot).read(hal) {
            Ok(header) => header,
            Err(e) => {
                error!(self.entity ; "dropping packet in slot {index}: {e}");
                self.consume(hal, index, None);
                return true;
            }
        };

        let targets = match header.routing.targets(self.settings.my_direction) {
            Ok(targets) => targets,
            Err(e) => {
                warn!(self.entity ; "dropping packet in slot {index}: {e}");
                self.consume(hal, index, None);
                return true;
            }
        };

        if !self.can_forward_completely(hal, &targets) {
            return false;
        }
        if self.settings.trid_flush_check && !self.trids.flushed(index, hal) {
            return false;
        }
        let Some(trid) = self.trids.assign_next_id(index, hal) else {
            return false;
        };

        let size = header
            .packet_size_bytes()
            .min(self.buffer.slot_size_bytes());
        for direction in targets.forward.iter() {
            if let Some(sender) = &mut self.downstream.routers[direction.index()] {
                trace!(self.entity ; "forward slot {index} {direction}");
                sender.send_from(hal, slot, size, Some(trid));
            }
        }
        if targets.local {
            self.deliver_locally(hal, &header, slot, size, trid);
        }
        self.stats.packets += 1;
        self.stats.bytes += size as u64;
        self.consume(hal, index, Some(trid));
        true
    }

    /// Every required target has room for the packet.
    fn can_forward_completely<H: Hal + ?Sized>(&mut self, hal: &H, targets: &RouteTargets) -> bool {
        for direction in targets.forward.iter() {
            match &self.downstream.routers[direction.index()] {
                Some(sender) => {
                    if !sender.has_space(hal) {
                        return false;
                    }
                }
                None => {
                    if !self.warned_missing.contains(direction) {
                        warn!(self.entity ; "no downstream router {direction}, stalling");
                        self.warned_missing.insert(direction);
                    }
                    return false;
                }
            }
        }
        match (&self.downstream.local_relay, targets.local) {
            (Some(relay), true) => relay.has_space(hal),
            _ => true,
        }
    }

    fn deliver_locally<H: Hal + ?Sized>(
        &mut self,
        hal: &H,
        header: &PacketHeader,
        slot: L1Addr,
        size: usize,
        trid: TransactionId,
    ) {
        if let Some(relay) = &mut self.downstream.local_relay {
            relay.send_from(hal, slot, size, Some(trid));
            return;
        }
        let payload = slot + HEADER_SIZE_BYTES as u32;
        let payload_size = header.payload_size as usize;
        trace!(self.entity ; "deliver {:?}", header.command);
        match header.command {
            NocCommand::UnicastWrite { dest } => {
                hal.noc_write(payload, dest, payload_size, Some(trid));
            }
            NocCommand::InlineWrite { dest, value } => hal.noc_inline_write(dest, value),
            NocCommand::AtomicInc {
                semaphore,
                increment,
            } => hal.noc_atomic_inc(semaphore, increment),
            NocCommand::UnicastWriteAtomicInc {
                dest,
                semaphore,
                increment,
            } => {
                hal.noc_write(payload, dest, payload_size, Some(trid));
                hal.noc_atomic_inc(semaphore, increment);
            }
        }
    }

    /// Move past the packet at `wr_sent`.
    fn consume<H: Hal + ?Sized>(
        &mut self,
        hal: &H,
        index: BufferIndex,
        trid: Option<TransactionId>,
    ) {
        if trid.is_none() {
            self.trids.clear(index);
        }
        self.pointers.wr_sent.increment();
        if !self.settings.first_level_ack {
            self.pointers.ack = self.pointers.wr_sent;
            hal.increment_local(streams::to_receiver_pkts_sent(self.vc), -1);
        }
    }

    fn flush<H: Hal + ?Sized>(&mut self, hal: &H) -> bool {
        if self.pointers.wr_flush.is_caught_up_to(&self.pointers.wr_sent) {
            return false;
        }
        let index = self.pointers.wr_flush.buffer_index();
        if !self.trids.flushed(index, hal) {
            return false;
        }
        self.pointers.wr_flush.increment();
        self.trids.clear(index);
        true
    }

    fn complete<H: Hal + ?Sized>(&mut self, hal: &H) -> bool {
        if self.pointers.completion.is_caught_up_to(&self.pointers.wr_flush)
            || !self.queue_ready(hal)
        {
            return false;
        }
        let index = self.pointers.completion.buffer_index();
        let src_ch_id = self.pointers.src_ch_id(index);
        self.send_credit(hal, streams::to_sender_pkts_completed(src_ch_id as usize));
        self.pointers.completion.increment();
        true
    }

    fn flush_and_complete<H: Hal + ?Sized>(&mut self, hal: &H) -> bool {
        if self.pointers.completion.is_caught_up_to(&self.pointers.wr_sent) {
            return false;
        }
        let index = self.pointers.completion.buffer_index();
        if !self.trids.flushed(index, hal) || !self.queue_ready(hal) {
            return false;
        }
        let src_ch_id = self.pointers.src_ch_id(index);
        self.send_credit(hal, streams::to_sender_pkts_completed(src_ch_id as usize));
        self.trids.clear(index);
        self.pointers.completion.increment();
        self.pointers.wr_flush = self.pointers.completion;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::StreamRegisters;
    use crate::layout::EdmMemoryMap;
    use crate::routing::{
        HopCommand, LineRouting, LowLatencyLineRouting, MeshRouting, RoutingFields,
    };
    use crate::test_helpers::{MockHal, test_entity};
    use crate::types::{CoreCoord, NocAddr};
    use crate::view::TypedView;

    const N: usize = 4;
    const DEST: NocAddr = NocAddr::new(CoreCoord::new(6, 6), 0x9000);

    fn settings(my_direction: Direction, first_level_ack: bool) -> ReceiverSettings {
        ReceiverSettings {
            my_direction,
            first_level_ack,
            fuse_flush_and_completion: false,
            trid_flush_check: false,
            txq: TxqId(1),
            spin_wait: true,
        }
    }

    /// Downstream routers on neighbouring cores, one per direction.
    fn downstream(me: Direction, directions: &[Direction]) -> DownstreamSenders {
        let map = EdmMemoryMap::new(256, &[N; 4], &[N]);
        let mut senders = DownstreamSenders::default();
        for d in directions {
            let channel = 1 + me.compact_index(*d).unwrap_or(0);
            let endpoint = map.endpoint(CoreCoord::new(10 + d.index() as u8, 0), channel);
            senders.routers[d.index()] = Some(FabricSender::persistent(
                endpoint,
                streams::downstream_free_slots(0, *d),
            ));
        }
        senders
    }

    fn receiver(
        hal: &MockHal,
        settings: ReceiverSettings,
        downstream: DownstreamSenders,
    ) -> (ReceiverChannel<u32>, EdmMemoryMap) {
        receiver_of_width(hal, settings, downstream)
    }

    /// A receiver on the west link with nothing to forward to.
    fn west_receiver(hal: &MockHal, first_level_ack: bool) -> (ReceiverChannel<u32>, EdmMemoryMap) {
        receiver(
            hal,
            settings(Direction::West, first_level_ack),
            downstream(Direction::West, &[]),
        )
    }

    fn receiver_of_width<W: CounterWord>(
        hal: &MockHal,
        settings: ReceiverSettings,
        downstream: DownstreamSenders,
    ) -> (ReceiverChannel<W>, EdmMemoryMap) {
        let map = EdmMemoryMap::new(256, &[N], &[N]);
        let mut rx = ReceiverChannel::new(
            &test_entity(),
            0,
            ChannelBuffer::new(map.receiver_buffer_base(0), 256, N),
            TransactionIdTracker::new(N, 0, 4),
            downstream,
            settings,
        );
        rx.initialize(hal);
        (rx, map)
    }

    /// Land a packet in the next receive slot as the peer sender would.
    fn arrive(
        hal: &MockHal,
        map: &EdmMemoryMap,
        slot: usize,
        src_ch_id: u8,
        routing: RoutingFields,
    ) {
        let mut header = PacketHeader::new(NocCommand::UnicastWrite { dest: DEST }, 32, routing);
        header.src_ch_id = src_ch_id;
        PacketHeader::view(map.receiver_buffer_base(0) + (slot * 256) as u32).write(hal, &header);
        hal.increment_local(streams::to_receiver_pkts_sent(0), 1);
    }

    fn line(distance: u8) -> RoutingFields {
        RoutingFields::Line(LineRouting::unicast(distance).unwrap())
    }

    fn completions(hal: &MockHal) -> usize {
        hal.remote_increments()
            .iter()
            .filter(|(_, stream, _)| *stream == streams::to_sender_pkts_completed(0))
            .count()
    }

    #[test]
    fn local_delivery_then_completion() {
        let hal = MockHal::default();
        let (mut rx, map) = west_receiver(&hal, false);
        arrive(&hal, &map, 0, 0, line(1));

        assert!(rx.step(&hal));
        let writes = hal.noc_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, DEST);
        assert_eq!(writes[0].2, 32);
        assert_eq!(hal.read_counter(streams::to_receiver_pkts_sent(0)), 0);
        assert_eq!(completions(&hal), 1);
        assert!(rx.is_drained(&hal));
    }

    #[test]
    fn completion_waits_for_write_to_land() {
        let hal = MockHal::default();
        let (mut rx, map) = west_receiver(&hal, false);
        hal.hold_new_transactions(true);
        arrive(&hal, &map, 0, 0, line(1));

        rx.step(&hal);
        rx.step(&hal);
        assert_eq!(hal.noc_writes().len(), 1);
        assert_eq!(completions(&hal), 0);
        assert_eq!(rx.pointers().wr_flush.counter().value(), 0);
        assert!(!rx.all_transactions_flushed(&hal));

        hal.release_transaction(TransactionId(0));
        rx.step(&hal);
        assert_eq!(completions(&hal), 1);
        assert!(rx.all_transactions_flushed(&hal));
    }

    #[test]
    fn first_level_ack_goes_to_source_channel() {
        let hal = MockHal::default();
        let (mut rx, map) = west_receiver(&hal, true);
        arrive(&hal, &map, 0, 3, line(1));
        rx.step(&hal);
        assert_eq!(
            hal.remote_increments(),
            vec![
                (TxqId(1), streams::to_sender_pkts_acked(3), 1),
                (TxqId(1), streams::to_sender_pkts_completed(3), 1),
            ]
        );
    }

    #[test]
    fn backpressure_holds_the_packet() {
        let hal = MockHal::default();
        let (mut rx, map) = receiver(
            &hal,
            settings(Direction::West, false),
            downstream(Direction::West, &[Direction::East]),
        );
        hal.init_counter(streams::downstream_free_slots(0, Direction::East), 0);
        arrive(&hal, &map, 0, 0, line(2));

        for _ in 0..50 {
            assert!(!rx.step(&hal));
        }
        assert_eq!(hal.read_counter(streams::to_receiver_pkts_sent(0)), 1);
        assert!(hal.noc_writes().is_empty());

        hal.increment_local(streams::downstream_free_slots(0, Direction::East), 1);
        assert!(rx.step(&hal));
        assert_eq!(hal.read_counter(streams::to_receiver_pkts_sent(0)), 0);
        assert_eq!(hal.noc_writes().len(), 1);
    }

    #[test]
    fn nsew_multicast_fans_out() {
        use Direction::*;
        let hal = MockHal::default();
        let (mut rx, map) = receiver(
            &hal,
            settings(North, false),
            downstream(North, &[East, West, South]),
        );
        let routing = MeshRouting::multicast(
            &[HopCommand::WriteAndForwardNsew],
            &[HopCommand::ForwardWest],
            &[HopCommand::ForwardEast],
        )
        .unwrap();
        arrive(&hal, &map, 0, 0, RoutingFields::Mesh(routing));

        assert!(rx.step(&hal));
        let writes = hal.noc_writes();
        assert_eq!(writes.len(), 4);
        let local: Vec<_> = writes.iter().filter(|w| w.1 == DEST).collect();
        assert_eq!(local.len(), 1);
        let forwarded: Vec<u8> = writes
            .iter()
            .filter(|w| w.1 != DEST)
            .map(|w| w.1.core.x)
            .collect();
        assert_eq!(forwarded, vec![10, 11, 13]);
        for d in [East, West, South] {
            assert_eq!(hal.read_counter(streams::downstream_free_slots(0, d)), N as i32 - 1);
        }
    }

    #[test]
    fn fan_out_waits_for_every_direction() {
        use Direction::*;
        let hal = MockHal::default();
        let (mut rx, map) = receiver(
            &hal,
            settings(North, false),
            downstream(North, &[East, West, South]),
        );
        hal.init_counter(streams::downstream_free_slots(0, West), 0);
        let routing = MeshRouting::from_commands(&[HopCommand::WriteAndForwardNsew]).unwrap();
        arrive(&hal, &map, 0, 0, RoutingFields::Mesh(routing));
        assert!(!rx.step(&hal));
        assert!(hal.noc_writes().is_empty());
    }

    #[test]
    fn missing_downstream_stalls() {
        let hal = MockHal::default();
        let (mut rx, map) = west_receiver(&hal, false);
        arrive(&hal, &map, 0, 0, line(3));
        assert!(!rx.step(&hal));
        assert!(!rx.step(&hal));
        assert_eq!(hal.read_counter(streams::to_receiver_pkts_sent(0)), 1);
    }

    #[test]
    fn exhausted_low_latency_route_is_dropped() {
        let hal = MockHal::default();
        let (mut rx, map) = west_receiver(&hal, false);
        let exhausted = RoutingFields::LowLatencyLine(LowLatencyLineRouting(0));
        arrive(&hal, &map, 0, 0, exhausted);
        assert!(rx.step(&hal));
        assert!(hal.noc_writes().is_empty());
        assert_eq!(completions(&hal), 1);
    }

    #[test]
    fn malformed_line_route_is_dropped() {
        let hal = MockHal::default();
        let (mut rx, map) = west_receiver(&hal, false);
        arrive(&hal, &map, 0, 2, RoutingFields::Line(LineRouting(0x01)));
        assert!(rx.step(&hal));
        assert!(hal.noc_writes().is_empty());
        assert_eq!(
            hal.remote_increments(),
            vec![(TxqId(1), streams::to_sender_pkts_completed(2), 1)]
        );
    }

    #[test]
    fn undecodable_header_completes_to_its_source() {
        let hal = MockHal::default();
        let (mut rx, map) = west_receiver(&hal, false);
        arrive(&hal, &map, 0, 3, line(1));
        TypedView::<u8>::at(map.receiver_buffer_base(0)).write(&hal, &0xee);

        assert!(rx.step(&hal));
        assert!(hal.noc_writes().is_empty());
        assert_eq!(
            hal.remote_increments(),
            vec![(TxqId(1), streams::to_sender_pkts_completed(3), 1)]
        );
        assert!(rx.is_drained(&hal));
    }

    #[test]
    fn fused_flush_and_completion() {
        let hal = MockHal::default();
        let mut fused = settings(Direction::West, true);
        fused.fuse_flush_and_completion = true;
        let (mut rx, map) = receiver(&hal, fused, downstream(Direction::West, &[]));
        for slot in 0..N {
            arrive(&hal, &map, slot, 0, line(1));
        }
        for _ in 0..3 * N {
            rx.step(&hal);
        }
        let pointers = rx.pointers();
        assert_eq!(pointers.completion.counter().value(), N as u32);
        assert!(pointers.wr_flush.is_caught_up_to(&pointers.completion));
        assert_eq!(completions(&hal), N);
    }

    #[test]
    fn pointers_wrap_at_eight_bits() {
        let hal = MockHal::default();
        let (mut rx, map) = receiver_of_width::<u8>(
            &hal,
            settings(Direction::West, false),
            downstream(Direction::West, &[]),
        );
        for i in 0..600usize {
            arrive(&hal, &map, i % N, (i % 2) as u8, line(1));
            assert!(rx.step(&hal));
            assert!(rx.is_drained(&hal));
        }
        let pointers = rx.pointers();
        assert_eq!(pointers.completion.counter().value(), (600 % 256) as u8);
        assert!(pointers.completion.is_caught_up_to(&pointers.ack));
        assert_eq!(hal.noc_writes().len(), 600);
        let to_channel_1 = hal
            .remote_increments()
            .iter()
            .filter(|(_, stream, _)| *stream == streams::to_sender_pkts_completed(1))
            .count();
        assert_eq!(completions(&hal) + to_channel_1, 600);
        assert_eq!(to_channel_1, 300);
    }

    #[test]
    fn idle_step_changes_nothing() {
        let hal = MockHal::default();
        let (mut rx, _) = west_receiver(&hal, true);
        let before = rx.pointers().clone();
        for _ in 0..10 {
            assert!(!rx.step(&hal));
        }
        assert_eq!(rx.pointers(), &before);
    }
}
