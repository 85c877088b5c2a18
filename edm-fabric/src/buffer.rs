// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A channel buffer: a ring of fixed-size slots each holding one packet.

use crate::counters::BufferIndex;
use crate::types::L1Addr;

#[derive(Clone, Debug)]
pub struct ChannelBuffer {
    base: L1Addr,
    slot_size_bytes: u32,
    num_buffers: usize,
    next: BufferIndex,
}

impl ChannelBuffer {
    #[must_use]
    pub fn new(base: L1Addr, slot_size_bytes: usize, num_buffers: usize) -> Self {
        Self {
            base,
            slot_size_bytes: slot_size_bytes as u32,
            num_buffers,
            next: BufferIndex::default(),
        }
    }

    #[must_use]
    pub fn slot_address(&self, index: BufferIndex) -> L1Addr {
        self.base + index.0 as u32 * self.slot_size_bytes
    }

    /// Address of the slot the buffer's own cursor points at.
    #[must_use]
    pub fn next_slot_address(&self) -> L1Addr {
        self.slot_address(self.next)
    }

    #[must_use]
    pub fn next_index(&self) -> BufferIndex {
        self.next
    }

    pub fn advance(&mut self) {
        self.next = self.next.next(self.num_buffers);
    }

    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    #[must_use]
    pub fn slot_size_bytes(&self) -> usize {
        self.slot_size_bytes as usize
    }
}
