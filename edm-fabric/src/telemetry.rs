// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Progress flags and router telemetry.

use std::ops::{BitOr, BitOrAssign};

use edm_track::entity::Entity;
use edm_track::value;

use crate::hal::LocalMemory;
use crate::layout::{RX_HEARTBEAT_ADDR, TX_HEARTBEAT_ADDR};
use crate::sender::ChannelStats;
use crate::view::TypedView;

/// Which halves of a router made progress during a batch of steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress(u8);

impl Progress {
    pub const NONE: Progress = Progress(0);
    pub const TX: Progress = Progress(1);
    pub const RX: Progress = Progress(2);

    #[must_use]
    pub fn contains(self, other: Progress) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `flag` if `made_progress`, otherwise nothing.
    #[must_use]
    pub fn when(made_progress: bool, flag: Progress) -> Progress {
        if made_progress { flag } else { Progress::NONE }
    }
}

impl BitOr for Progress {
    type Output = Progress;

    fn bitor(self, rhs: Progress) -> Progress {
        Progress(self.0 | rhs.0)
    }
}

impl BitOrAssign for Progress {
    fn bitor_assign(&mut self, rhs: Progress) {
        self.0 |= rhs.0;
    }
}

/// Counters kept by a router while it runs.
///
/// The heartbeats advance on every batch in which their half of the router
/// either made progress or had nothing to do, so a heartbeat that stops
/// advancing points at a stuck channel. They are published in L1 for the
/// host when telemetry is enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterTelemetry {
    pub tx_heartbeat: u32,
    pub rx_heartbeat: u32,
    pub batches: u64,
    pub active_tx_batches: u64,
    pub active_rx_batches: u64,
    pub context_switches: u64,
    /// Packets and bytes sent over the link.
    pub sent: ChannelStats,
    /// Packets and bytes delivered or forwarded by the receiver channels.
    pub received: ChannelStats,
}

impl RouterTelemetry {
    pub fn update<M: LocalMemory + ?Sized>(
        &mut self,
        memory: &M,
        progress: Progress,
        tx_idle: bool,
        rx_idle: bool,
        publish: bool,
    ) {
        self.batches += 1;
        if progress.contains(Progress::TX) {
            self.active_tx_batches += 1;
        }
        if progress.contains(Progress::RX) {
            self.active_rx_batches += 1;
        }
        if progress.contains(Progress::TX) || tx_idle {
            self.tx_heartbeat = self.tx_heartbeat.wrapping_add(1);
            if publish {
                TypedView::<u32>::at(TX_HEARTBEAT_ADDR).store(memory, self.tx_heartbeat);
            }
        }
        if progress.contains(Progress::RX) || rx_idle {
            self.rx_heartbeat = self.rx_heartbeat.wrapping_add(1);
            if publish {
                TypedView::<u32>::at(RX_HEARTBEAT_ADDR).store(memory, self.rx_heartbeat);
            }
        }
    }

    /// Emit the counters as value events of `entity`.
    pub fn report(&self, entity: &Entity) {
        value!(entity ; "batches", self.batches);
        value!(entity ; "active_tx_batches", self.active_tx_batches);
        value!(entity ; "active_rx_batches", self.active_rx_batches);
        value!(entity ; "context_switches", self.context_switches);
        value!(entity ; "packets_sent", self.sent.packets);
        value!(entity ; "bytes_sent", self.sent.bytes);
        value!(entity ; "packets_received", self.received.packets);
        value!(entity ; "bytes_received", self.received.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MockHal;

    #[test]
    fn progress_flags_combine() {
        let mut progress = Progress::NONE;
        assert!(progress.is_empty());
        progress |= Progress::when(false, Progress::TX);
        assert!(progress.is_empty());
        progress |= Progress::when(true, Progress::RX);
        assert!(progress.contains(Progress::RX));
        assert!(!progress.contains(Progress::TX));
        assert!((progress | Progress::TX).contains(Progress::TX | Progress::RX));
    }

    #[test]
    fn stuck_half_stops_its_heartbeat() {
        let hal = MockHal::default();
        let mut telemetry = RouterTelemetry::default();
        telemetry.update(&hal, Progress::TX, false, false, true);
        telemetry.update(&hal, Progress::NONE, true, false, true);
        telemetry.update(&hal, Progress::NONE, false, false, true);

        assert_eq!(telemetry.tx_heartbeat, 2);
        assert_eq!(telemetry.rx_heartbeat, 0);
        assert_eq!(telemetry.batches, 3);
        assert_eq!(telemetry.active_tx_batches, 1);
        assert_eq!(TypedView::<u32>::at(TX_HEARTBEAT_ADDR).load(&hal), 2);
    }
}
