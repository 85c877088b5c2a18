// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The sender channel: moves packets written by a producer across the link.
//!
//! The producer fills slots of the channel buffer and decrements the
//! channel's free slots register. Each step the channel sends at most one
//! packet to the remote receiver, then turns the ack and completion credits
//! returned by the remote receiver into credits for the producer.

use std::sync::Arc;

use edm_track::entity::Entity;
use edm_track::{error, trace};

use crate::buffer::ChannelBuffer;
use crate::connection::ProducerConnection;
use crate::counters::{CounterWord, FreeRunningCounter};
use crate::direction::Direction;
use crate::hal::{Hal, wait_for_txq};
use crate::header::PacketHeader;
use crate::layout::streams;
use crate::types::{L1Addr, TxqId};

/// The remote receiver channel of a virtual channel, as tracked by the
/// sender channels feeding it.
///
/// All sender channels of a virtual channel share the remote buffer: they
/// send into consecutive remote slots and share its free slot count.
#[derive(Debug)]
pub struct OutboundReceiverChannel {
    vc: usize,
    remote: ChannelBuffer,
    num_free_slots: usize,
}

impl OutboundReceiverChannel {
    #[must_use]
    pub fn new(vc: usize, remote: ChannelBuffer) -> Self {
        let num_free_slots = remote.num_buffers();
        Self {
            vc,
            remote,
            num_free_slots,
        }
    }

    #[must_use]
    pub fn vc(&self) -> usize {
        self.vc
    }

    #[must_use]
    pub fn num_free_slots(&self) -> usize {
        self.num_free_slots
    }

    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.remote.num_buffers()
    }

    fn next_slot_address(&self) -> L1Addr {
        self.remote.next_slot_address()
    }

    fn consume_slot(&mut self) {
        self.remote.advance();
        self.num_free_slots -= 1;
    }

    fn release_slots(&mut self, n: usize) {
        self.num_free_slots += n;
    }
}

/// How a sender channel rewrites the routing of a packet before it leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderUpdate {
    /// Packets written by a worker already carry first hop routing.
    None,
    NextHop {
        /// Direction of the link this channel sends on.
        direction: Direction,
        /// Traffic from a north/south router leaving east/west joins a branch.
        turn: bool,
    },
}

impl HeaderUpdate {
    /// The update for sender channel `channel` of the router facing
    /// `direction`. Channel 0 is fed by workers, channel `k > 0` by the
    /// router of the `k - 1`th other direction of the chip.
    #[must_use]
    pub fn for_channel(channel: usize, direction: Direction) -> Self {
        if channel == 0 {
            return HeaderUpdate::None;
        }
        let source = Direction::ALL
            .into_iter()
            .filter(|d| *d != direction)
            .nth(channel - 1);
        let turn = !direction.is_spine() && source.is_some_and(Direction::is_spine);
        HeaderUpdate::NextHop { direction, turn }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SenderSettings {
    pub first_level_ack: bool,
    /// Minimum free remote slots before an injection channel may send.
    pub bubble_min_free_slots: Option<usize>,
    pub txq: TxqId,
    /// Spin on a busy transmit queue rather than skip the step.
    pub spin_wait: bool,
}

/// The ordered credit pointers of a sender channel.
///
/// `completion <= ack <= write` at every step boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SenderChannelPointers<W: CounterWord> {
    pub write: FreeRunningCounter<W>,
    pub ack: FreeRunningCounter<W>,
    pub completion: FreeRunningCounter<W>,
}

impl<W: CounterWord> SenderChannelPointers<W> {
    /// Packets sent but not yet completed by the remote receiver.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.write.distance_from(&self.completion)
    }

    #[must_use]
    pub fn unacked(&self) -> usize {
        self.write.distance_from(&self.ack)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub packets: u64,
    pub bytes: u64,
}

pub struct SenderChannel<W: CounterWord = u32> {
    pub entity: Arc<Entity>,
    channel: usize,
    buffer: ChannelBuffer,
    connection: ProducerConnection,
    header_update: HeaderUpdate,
    settings: SenderSettings,
    injection: bool,
    pointers: SenderChannelPointers<W>,
    stats: ChannelStats,
}

impl<W: CounterWord> SenderChannel<W> {
    #[must_use]
    pub fn new(
        parent: &Arc<Entity>,
        channel: usize,
        buffer: ChannelBuffer,
        connection: ProducerConnection,
        header_update: HeaderUpdate,
        settings: SenderSettings,
    ) -> Self {
        Self {
            entity: Arc::new(Entity::new(parent, &format!("tx{channel}"))),
            channel,
            buffer,
            connection,
            header_update,
            settings,
            injection: channel == 0,
            pointers: SenderChannelPointers::default(),
            stats: ChannelStats::default(),
        }
    }

    /// Reset the channel registers and its connection.
    pub fn initialize<H: Hal + ?Sized>(&mut self, hal: &H) {
        hal.init_counter(
            streams::sender_free_slots(self.channel),
            self.buffer.num_buffers() as i32,
        );
        hal.init_counter(streams::to_sender_pkts_acked(self.channel), 0);
        hal.init_counter(streams::to_sender_pkts_completed(self.channel), 0);
        self.connection.reset(hal);
    }

    #[must_use]
    pub fn channel(&self) -> usize {
        self.channel
    }

    #[must_use]
    pub fn pointers(&self) -> SenderChannelPointers<W> {
        self.pointers
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    #[must_use]
    pub fn connection(&self) -> &ProducerConnection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ProducerConnection {
        &mut self.connection
    }

    /// Packets written by the producer and not yet sent.
    pub fn unsent<H: Hal + ?Sized>(&self, hal: &H) -> usize {
        let free = hal.read_counter(streams::sender_free_slots(self.channel));
        self.buffer
            .num_buffers()
            .saturating_sub(free.max(0) as usize)
    }

    /// Whether everything written to the channel has been completed.
    pub fn is_drained<H: Hal + ?Sized>(&self, hal: &H) -> bool {
        self.unsent(hal) == 0 && self.pointers.occupancy() == 0
    }

    /// Run one step, returning whether any progress was made.
    pub fn step<H: Hal + ?Sized>(
        &mut self,
        hal: &H,
        outbound: &mut OutboundReceiverChannel,
    ) -> bool {
        hal.invalidate_local_view();
        let mut progress = false;

        let remote_has_space = match self.settings.bubble_min_free_slots {
            Some(min) if self.injection => outbound.num_free_slots() >= min,
            _ => outbound.num_free_slots() != 0,
        };
        let mut can_send = remote_has_space && self.unsent(hal) > 0;
        if !self.settings.spin_wait {
            can_send = can_send && !hal.queue_is_busy(self.settings.txq);
        }
        if can_send {
            self.send_next(hal, outbound);
            progress = true;
        }

        // Completions are sampled before acks so that no more completions
        // than acks are ever seen.
        let completed = W::from_register(
            hal.read_counter(streams::to_sender_pkts_completed(self.channel)),
        );
        let acked = W::from_register(hal.read_counter(streams::to_sender_pkts_acked(self.channel)));

        if self.settings.first_level_ack {
            let new_acks = self.pointers.ack.behind_by(acked);
            if new_acks > 0 {
                self.pointers.ack.increment_by(new_acks);
                self.connection.return_credits(hal, new_acks, &self.entity);
                progress = true;
            }
        }

        let new_completions = self.pointers.completion.behind_by(completed);
        if new_completions > 0 {
            outbound.release_slots(new_completions);
            self.pointers.completion.increment_by(new_completions);
            if !self.settings.first_level_ack {
                self.pointers.ack = self.pointers.completion;
                self.connection
                    .return_credits(hal, new_completions, &self.entity);
            }
            progress = true;
        }

        if !self.connection.is_persistent() && self.connection.needs_check(hal) {
            self.connection.check(hal, &self.entity);
        }
        progress
    }

    fn send_next<H: Hal + ?Sized>(&mut self, hal: &H, outbound: &mut OutboundReceiverChannel) {
        let slot = self.buffer.next_slot_address();
        let size = match PacketHeader::view(slot).read(hal) {
            Ok(header) => {
                if let HeaderUpdate::NextHop { direction, turn } = self.header_update {
                    let routing = header.routing.advance_for_next_hop(direction, turn);
                    PacketHeader::routing_word_view(slot)
                        .store(hal, PacketHeader::routing_word(&routing));
                }
                header
                    .packet_size_bytes()
                    .min(self.buffer.slot_size_bytes())
            }
            Err(e) => {
                // The remote receiver drops what it cannot decode.
                error!(self.entity ; "slot {:#x}: {e}", slot);
                self.buffer.slot_size_bytes()
            }
        };
        PacketHeader::src_ch_id_view(slot).write(hal, &(self.channel as u8));

        if self.settings.spin_wait {
            wait_for_txq(hal, self.settings.txq);
        }
        hal.send_bytes(self.settings.txq, slot, outbound.next_slot_address(), size);
        trace!(self.entity ; "sent {size} bytes from {:#x}", slot);

        self.buffer.advance();
        outbound.consume_slot();
        self.pointers.write.increment();
        self.stats.packets += 1;
        self.stats.bytes += size as u64;

        wait_for_txq(hal, self.settings.txq);
        hal.increment_remote(
            self.settings.txq,
            streams::to_receiver_pkts_sent(outbound.vc()),
            1,
        );
        hal.increment_local(streams::sender_free_slots(self.channel), 1);
    }
}
