// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! One-time synchronisation before traffic starts.
//!
//!  - The link handshake between the two ends of a link. The master keeps
//!    sending until the subordinate replies, so it does not matter which
//!    end initializes first.
//!  - The local handshake between the routers of one chip, gathered by a
//!    local master.
//!  - The barrier between the two cores of one router.
//!
//! Every wait here spins until its condition holds. A link that never comes
//! up leaves the router waiting with its status showing how far it got.

use edm_track::entity::Entity;
use edm_track::{debug, trace};

use crate::hal::Hal;
use crate::layout::{
    HANDSHAKE_ACK_ADDR, HANDSHAKE_ADDR, HANDSHAKE_STAGING_ADDR, LOCAL_SYNC_ADDR,
    MULTI_CORE_BARRIER_SCRATCH,
};
use crate::types::{CoreCoord, L1Addr, NocAddr, TxqId};
use crate::view::TypedView;

pub const HANDSHAKE_MAGIC: u32 = 0xedd0_5a1e;

/// Polls of the reply between two handshake requests.
const HANDSHAKE_RESEND_POLLS: usize = 1000;

const BARRIER_START: u32 = 0x0fed;
const BARRIER_REPLY: u32 = 0x1bad;
const BARRIER_MASK: u32 = 0x1fff;

/// Spin until `ready` holds, letting the background routine run meanwhile.
pub fn wait_until<H: Hal + ?Sized>(hal: &H, mut ready: impl FnMut(&H) -> bool) {
    loop {
        hal.invalidate_local_view();
        if ready(hal) {
            return;
        }
        hal.context_switch();
    }
}

/// Spin until the word at `addr` holds `value`.
pub fn wait_for_notification<H: Hal + ?Sized>(hal: &H, addr: L1Addr, value: u32) {
    let word = TypedView::<u32>::at(addr);
    wait_until(hal, |hal| word.load(hal) == value);
}

/// Clear the handshake words, done before the link handshake so a stale
/// reply of an earlier run is never mistaken for the peer.
pub fn reset<H: Hal + ?Sized>(hal: &H) {
    TypedView::<u32>::at(HANDSHAKE_ADDR).store(hal, 0);
    TypedView::<u32>::at(HANDSHAKE_ACK_ADDR).store(hal, 0);
    TypedView::<u32>::at(HANDSHAKE_STAGING_ADDR).store(hal, HANDSHAKE_MAGIC);
    TypedView::<u32>::at(LOCAL_SYNC_ADDR).store(hal, 0);
}

/// The master end of the link handshake.
pub fn sender_side_handshake<H: Hal + ?Sized>(hal: &H, txq: TxqId, entity: &Entity) {
    let reply = TypedView::<u32>::at(HANDSHAKE_ACK_ADDR);
    let mut polls = 0;
    wait_until(hal, |hal| {
        if reply.load(hal) == HANDSHAKE_MAGIC {
            return true;
        }
        if polls % HANDSHAKE_RESEND_POLLS == 0 && !hal.queue_is_busy(txq) {
            trace!(entity ; "handshake request");
            hal.send_bytes(txq, HANDSHAKE_STAGING_ADDR, HANDSHAKE_ADDR, 4);
        }
        polls += 1;
        false
    });
    reply.store(hal, 0);
    debug!(entity ; "link handshake complete");
}

/// The subordinate end of the link handshake.
pub fn receiver_side_handshake<H: Hal + ?Sized>(hal: &H, txq: TxqId, entity: &Entity) {
    wait_for_notification(hal, HANDSHAKE_ADDR, HANDSHAKE_MAGIC);
    TypedView::<u32>::at(HANDSHAKE_ADDR).store(hal, 0);
    wait_until(hal, |hal| !hal.queue_is_busy(txq));
    hal.send_bytes(txq, HANDSHAKE_STAGING_ADDR, HANDSHAKE_ACK_ADDR, 4);
    debug!(entity ; "link handshake complete");
}

/// Gather the routers of a chip.
///
/// Subordinates count themselves in at the master, which then releases them
/// all by writing the number of routers into their sync word.
pub fn local_handshake<H: Hal + ?Sized>(
    hal: &H,
    master: Option<CoreCoord>,
    subordinates: &[CoreCoord],
    num_local_edms: usize,
    entity: &Entity,
) {
    let num_local_edms = num_local_edms as u32;
    match master {
        None => {
            wait_for_notification(hal, LOCAL_SYNC_ADDR, num_local_edms - 1);
            notify_subordinates(hal, subordinates, LOCAL_SYNC_ADDR, num_local_edms);
            TypedView::<u32>::at(LOCAL_SYNC_ADDR).store(hal, num_local_edms);
        }
        Some(master) => {
            hal.noc_atomic_inc(NocAddr::new(master, LOCAL_SYNC_ADDR), 1);
            wait_for_notification(hal, LOCAL_SYNC_ADDR, num_local_edms);
        }
    }
    debug!(entity ; "local handshake with {num_local_edms} routers complete");
}

/// Write `value` at `addr` on every subordinate router of the chip.
pub fn notify_subordinates<H: Hal + ?Sized>(
    hal: &H,
    subordinates: &[CoreCoord],
    addr: L1Addr,
    value: u32,
) {
    for core in subordinates {
        hal.noc_inline_write(NocAddr::new(*core, addr), value);
    }
}

/// The barrier between the two cores of one router, over a scratch
/// register both can see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultiCoreBarrier {
    master: bool,
}

impl MultiCoreBarrier {
    #[must_use]
    pub fn new(master: bool) -> Self {
        Self { master }
    }

    pub fn wait<H: Hal + ?Sized>(&self, hal: &H) {
        let sync = |hal: &H| hal.read_scratch(MULTI_CORE_BARRIER_SCRATCH) & BARRIER_MASK;
        if self.master {
            hal.write_scratch(MULTI_CORE_BARRIER_SCRATCH, BARRIER_START);
            wait_until(hal, |hal| sync(hal) == BARRIER_REPLY);
            hal.write_scratch(MULTI_CORE_BARRIER_SCRATCH, 0);
        } else {
            wait_until(hal, |hal| sync(hal) == BARRIER_START);
            hal.write_scratch(MULTI_CORE_BARRIER_SCRATCH, BARRIER_REPLY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{EthTransport, StreamRegisters};
    use crate::test_helpers::{MockHal, test_entity};

    #[test]
    fn master_resends_until_reply() {
        let hal = MockHal::default();
        reset(&hal);
        TypedView::<u32>::at(HANDSHAKE_ACK_ADDR).store(&hal, HANDSHAKE_MAGIC);
        sender_side_handshake(&hal, TxqId(0), &test_entity());
        assert_eq!(TypedView::<u32>::at(HANDSHAKE_ACK_ADDR).load(&hal), 0);
        // The reply was already there, nothing needed sending.
        assert!(hal.sent_bytes().is_empty());
    }

    #[test]
    fn loopback_handshake_reaches_itself() {
        let hal = MockHal::loopback();
        reset(&hal);
        // Over a loopback link the request lands in our own handshake word.
        hal.send_bytes(TxqId(0), HANDSHAKE_STAGING_ADDR, HANDSHAKE_ADDR, 4);
        receiver_side_handshake(&hal, TxqId(0), &test_entity());
        assert_eq!(TypedView::<u32>::at(HANDSHAKE_ACK_ADDR).load(&hal), HANDSHAKE_MAGIC);
        sender_side_handshake(&hal, TxqId(0), &test_entity());
        assert_eq!(
            hal.sent_bytes().last(),
            Some(&(TxqId(0), HANDSHAKE_STAGING_ADDR, HANDSHAKE_ACK_ADDR, 4))
        );
    }

    #[test]
    fn subordinate_counts_in_at_master() {
        let hal = MockHal::default();
        let master = CoreCoord::new(7, 0);
        TypedView::<u32>::at(LOCAL_SYNC_ADDR).store(&hal, 3);
        local_handshake(&hal, Some(master), &[], 3, &test_entity());
        assert_eq!(
            hal.noc_atomic_incs(),
            vec![(NocAddr::new(master, LOCAL_SYNC_ADDR), 1)]
        );
    }

    #[test]
    fn master_releases_subordinates() {
        let hal = MockHal::default();
        let subordinates = [CoreCoord::new(2, 0), CoreCoord::new(3, 0)];
        TypedView::<u32>::at(LOCAL_SYNC_ADDR).store(&hal, 2);
        local_handshake(&hal, None, &subordinates, 3, &test_entity());
        assert_eq!(
            hal.noc_inline_writes(),
            vec![
                (NocAddr::new(subordinates[0], LOCAL_SYNC_ADDR), 3),
                (NocAddr::new(subordinates[1], LOCAL_SYNC_ADDR), 3),
            ]
        );
    }

    #[test]
    fn barrier_subordinate_replies() {
        let hal = MockHal::default();
        hal.write_scratch(MULTI_CORE_BARRIER_SCRATCH, BARRIER_START);
        MultiCoreBarrier::new(false).wait(&hal);
        assert_eq!(hal.read_scratch(MULTI_CORE_BARRIER_SCRATCH), BARRIER_REPLY);
    }
}
