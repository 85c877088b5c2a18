// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Tracks the asynchronous NoC writes issued on behalf of each buffer slot.
//!
//! A receiver slot may only be reused once the writes that forwarded its
//! packet have landed. Each slot records the transaction id its writes were
//! issued with. Ids come from a small pool handed out round-robin; an id that
//! still has writes in flight is never handed out again, the caller stalls
//! instead.

use crate::counters::BufferIndex;
use crate::hal::NocInterface;
use crate::types::TransactionId;

#[derive(Debug)]
pub struct TransactionIdTracker {
    slot_ids: Vec<Option<TransactionId>>,
    base_id: u8,
    num_ids: u8,
    next: u8,
}

impl TransactionIdTracker {
    #[must_use]
    pub fn new(num_buffers: usize, base_id: u8, num_ids: u8) -> Self {
        Self {
            slot_ids: vec![None; num_buffers],
            base_id,
            num_ids,
            next: 0,
        }
    }

    fn peek_next_id(&self) -> TransactionId {
        TransactionId(self.base_id + self.next)
    }

    /// Whether the next id in the pool has nothing in flight.
    pub fn next_id_available<H: NocInterface + ?Sized>(&self, hal: &H) -> bool {
        hal.transaction_flushed(self.peek_next_id())
    }

    /// Assign the next id of the pool to `index`.
    ///
    /// Returns `None` if that id is still in flight.
    pub fn assign_next_id<H: NocInterface + ?Sized>(
        &mut self,
        index: BufferIndex,
        hal: &H,
    ) -> Option<TransactionId> {
        if !self.next_id_available(hal) {
            return None;
        }
        let id = self.peek_next_id();
        self.slot_ids[index.get()] = Some(id);
        self.next = (self.next + 1) % self.num_ids;
        Some(id)
    }

    #[must_use]
    pub fn id_at(&self, index: BufferIndex) -> Option<TransactionId> {
        self.slot_ids[index.get()]
    }

    /// Whether the writes issued for the slot have landed.
    ///
    /// A slot with no id recorded has nothing outstanding.
    pub fn flushed<H: NocInterface + ?Sized>(&self, index: BufferIndex, hal: &H) -> bool {
        match self.slot_ids[index.get()] {
            Some(id) => hal.transaction_flushed(id),
            None => true,
        }
    }

    pub fn clear(&mut self, index: BufferIndex) {
        self.slot_ids[index.get()] = None;
    }

    pub fn all_flushed<H: NocInterface + ?Sized>(&self, hal: &H) -> bool {
        self.slot_ids
            .iter()
            .flatten()
            .all(|id| hal.transaction_flushed(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MockHal;

    #[test]
    fn ids_round_robin_over_pool() {
        let hal = MockHal::default();
        let mut tracker = TransactionIdTracker::new(8, 4, 3);
        let ids: Vec<u8> = (0..6)
            .map(|i| tracker.assign_next_id(BufferIndex(i), &hal).unwrap().0)
            .collect();
        assert_eq!(ids, vec![4, 5, 6, 4, 5, 6]);
    }

    #[test]
    fn stalls_while_next_id_in_flight() {
        let hal = MockHal::default();
        let mut tracker = TransactionIdTracker::new(4, 0, 2);
        let first = tracker.assign_next_id(BufferIndex(0), &hal).unwrap();
        hal.hold_transaction(first);
        tracker.assign_next_id(BufferIndex(1), &hal).unwrap();

        // The pool has wrapped back to the id held by slot 0.
        assert!(tracker.assign_next_id(BufferIndex(2), &hal).is_none());
        assert!(!tracker.flushed(BufferIndex(0), &hal));
        assert!(!tracker.all_flushed(&hal));

        hal.release_transaction(first);
        assert!(tracker.flushed(BufferIndex(0), &hal));
        assert_eq!(tracker.assign_next_id(BufferIndex(2), &hal), Some(first));
    }

    #[test]
    fn cleared_slot_is_flushed() {
        let hal = MockHal::default();
        let mut tracker = TransactionIdTracker::new(2, 0, 2);
        let id = tracker.assign_next_id(BufferIndex(1), &hal).unwrap();
        hal.hold_transaction(id);
        assert!(!tracker.flushed(BufferIndex(1), &hal));
        tracker.clear(BufferIndex(1));
        assert!(tracker.flushed(BufferIndex(1), &hal));
        assert_eq!(tracker.id_at(BufferIndex(1)), None);
    }
}
