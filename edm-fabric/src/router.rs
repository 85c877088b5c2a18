// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The router of one end of a link.
//!
//! A [`Router`] owns the sender and receiver channels it services and runs
//! them until the host asks it to terminate:
//!
//!  1. [`Router::new`] checks the configuration and builds the channels.
//!  2. [`Router::initialize`] resets the registers and L1 state the peer and
//!     the producers rely on. It never blocks.
//!  3. [`Router::run`] synchronises with the peer and the other routers of
//!     the chip, waits for the host, runs the main loop and tears down.
//!
//! When a router runs on two cores each core builds its own [`Router`]
//! from the same configuration with a different `risc_id`, and the two meet
//! at barriers between the phases of [`Router::run`].

use std::sync::Arc;

use edm_track::entity::Entity;
use edm_track::{debug, info};

use crate::adapter::FabricSender;
use crate::buffer::ChannelBuffer;
use crate::config::{RouterConfig, RouterWiring};
use crate::connection::{ConnectionKind, ProducerConnection};
use crate::counters::CounterWord;
use crate::direction::Direction;
use crate::hal::Hal;
use crate::handshake::{self, MultiCoreBarrier};
use crate::layout::{STATUS_ADDR, TERMINATION_SIGNAL_ADDR, streams};
use crate::receiver::{DownstreamSenders, ReceiverChannel, ReceiverSettings};
use crate::sender::{
    ChannelStats, HeaderUpdate, OutboundReceiverChannel, SenderChannel, SenderSettings,
};
use crate::telemetry::{Progress, RouterTelemetry};
use crate::trid::TransactionIdTracker;
use crate::types::{EdmStatus, FabricResult, TerminationSignal};
use crate::view::TypedView;

pub struct Router<H: Hal, W: CounterWord = u32> {
    pub entity: Arc<Entity>,
    hal: H,
    config: RouterConfig,
    wiring: RouterWiring,
    senders: Vec<SenderChannel<W>>,
    /// Virtual channel of each entry of `senders`.
    sender_vcs: Vec<usize>,
    outbound: Vec<OutboundReceiverChannel>,
    receivers: Vec<ReceiverChannel<W>>,
    barrier: Option<MultiCoreBarrier>,
    status: TypedView<EdmStatus>,
    termination: TypedView<TerminationSignal>,
    telemetry: RouterTelemetry,
}

impl<H: Hal, W: CounterWord> Router<H, W> {
    pub fn new(
        parent: &Arc<Entity>,
        name: &str,
        hal: H,
        config: RouterConfig,
        wiring: RouterWiring,
    ) -> FabricResult<Self> {
        config.validate()?;
        wiring.validate(&config)?;
        let entity = Arc::new(Entity::new(parent, name));
        let map = config.memory_map();
        let slot_size = config.slot_size_bytes;

        let sender_settings = SenderSettings {
            first_level_ack: config.first_level_ack,
            bubble_min_free_slots: config
                .bubble_flow_control
                .then_some(config.bubble_min_free_slots),
            txq: config.sender_txq,
            spin_wait: config.spin_wait,
        };
        let mut senders = Vec::new();
        let mut sender_vcs = Vec::new();
        for (channel, channel_config) in config.sender_channels.iter().enumerate() {
            if !config.is_sender_serviced(channel) {
                continue;
            }
            let kind = if wiring.static_sender_channels.contains(&channel) {
                ConnectionKind::Persistent
            } else {
                ConnectionKind::Transient
            };
            senders.push(SenderChannel::new(
                &entity,
                channel,
                ChannelBuffer::new(
                    map.sender_buffer_base(channel),
                    slot_size,
                    channel_config.num_buffers,
                ),
                ProducerConnection::new(
                    map.connection_semaphore(channel),
                    map.producer_location(channel),
                    kind,
                ),
                HeaderUpdate::for_channel(channel, config.my_direction),
                sender_settings,
            ));
            sender_vcs.push(channel_config.vc);
        }

        let outbound = (0..config.num_receiver_channels())
            .map(|vc| {
                let remote = wiring.remote_receiver(vc, &map);
                OutboundReceiverChannel::new(
                    vc,
                    ChannelBuffer::new(remote.buffer_base, slot_size, remote.num_buffers),
                )
            })
            .collect();

        let receiver_settings = ReceiverSettings {
            my_direction: config.my_direction,
            first_level_ack: config.first_level_ack,
            fuse_flush_and_completion: config.fuse_flush_and_completion,
            trid_flush_check: config.trid_flush_check,
            txq: config.receiver_txq,
            spin_wait: config.spin_wait,
        };
        let mut receivers = Vec::new();
        for (vc, num_buffers) in config.receiver_num_buffers.iter().enumerate() {
            if !config.is_receiver_serviced(vc) {
                continue;
            }
            receivers.push(ReceiverChannel::new(
                &entity,
                vc,
                ChannelBuffer::new(map.receiver_buffer_base(vc), slot_size, *num_buffers),
                TransactionIdTracker::new(
                    *num_buffers,
                    config.transaction_id_base as u8,
                    config.num_transaction_ids as u8,
                ),
                downstream_senders(&wiring, vc),
                receiver_settings,
            ));
        }

        let barrier =
            (config.num_riscs > 1).then(|| MultiCoreBarrier::new(config.is_teardown_master()));
        debug!(entity ; "{} sender and {} receiver channels serviced",
            senders.len(), receivers.len());
        Ok(Self {
            entity,
            hal,
            config,
            wiring,
            senders,
            sender_vcs,
            outbound,
            receivers,
            barrier,
            status: TypedView::at(STATUS_ADDR),
            termination: TypedView::at(TERMINATION_SIGNAL_ADDR),
            telemetry: RouterTelemetry::default(),
        })
    }

    #[must_use]
    pub fn hal(&self) -> &H {
        &self.hal
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[must_use]
    pub fn telemetry(&self) -> RouterTelemetry {
        self.telemetry
    }

    pub fn senders(&self) -> &[SenderChannel<W>] {
        &self.senders
    }

    pub fn receivers(&self) -> &[ReceiverChannel<W>] {
        &self.receivers
    }

    /// The status last written to L1, if it decodes.
    pub fn status(&self) -> FabricResult<EdmStatus> {
        self.status.read(&self.hal)
    }

    fn set_status(&self, status: EdmStatus) {
        self.status.write(&self.hal, &status);
        info!(self.entity ; "status {:?}", status);
    }

    fn sync_cores(&self) {
        if let Some(barrier) = &self.barrier {
            barrier.wait(&self.hal);
        }
    }

    /// Reset the state this core owns.
    pub fn initialize(&mut self) {
        let hal = &self.hal;
        if self.config.is_teardown_master() {
            self.status.write(hal, &EdmStatus::Started);
            self.termination.write(hal, &TerminationSignal::KeepRunning);
            handshake::reset(hal);
        }
        for sender in &mut self.senders {
            sender.initialize(hal);
        }
        for receiver in &mut self.receivers {
            receiver.initialize(hal);
        }
        debug!(self.entity ; "initialized");
    }

    /// Start up, run until terminated, then tear down.
    pub fn run(&mut self) -> FabricResult<RouterTelemetry> {
        self.start()?;
        self.main_loop();
        self.teardown();
        Ok(self.telemetry)
    }

    fn start(&mut self) -> FabricResult {
        self.sync_cores();
        if self.config.is_teardown_master() {
            self.handshake();
        }

        self.sync_cores();
        for receiver in &mut self.receivers {
            receiver.open_downstream(&self.hal);
        }

        self.sync_cores();
        for sender in &mut self.senders {
            if sender.connection().kind() == ConnectionKind::Persistent {
                let entity = sender.entity.clone();
                sender
                    .connection_mut()
                    .wait_for_static_connection(&self.hal, &entity)?;
            }
        }

        self.sync_cores();
        info!(self.entity ; "main loop started");
        Ok(())
    }

    fn handshake(&self) {
        let hal = &self.hal;
        let config = &self.config;
        if config.enable_ethernet_handshake {
            if config.is_handshake_master {
                handshake::sender_side_handshake(hal, config.sender_txq, &self.entity);
            } else {
                handshake::receiver_side_handshake(hal, config.sender_txq, &self.entity);
            }
            self.set_status(EdmStatus::RemoteHandshakeComplete);
        }
        if !config.wait_for_host_signal {
            return;
        }

        let master = if config.local_handshake_master {
            None
        } else {
            self.wiring.local_master
        };
        handshake::local_handshake(
            hal,
            master,
            &self.wiring.local_edms,
            config.num_local_edms,
            &self.entity,
        );
        self.set_status(EdmStatus::LocalHandshakeComplete);

        // The host releases the local master, which releases the others.
        handshake::wait_for_notification(hal, STATUS_ADDR, EdmStatus::ReadyForTraffic as u32);
        if config.local_handshake_master {
            handshake::notify_subordinates(
                hal,
                &self.wiring.local_edms,
                STATUS_ADDR,
                EdmStatus::ReadyForTraffic as u32,
            );
        }
        info!(self.entity ; "ready for traffic");
    }

    /// Whether every channel serviced by this core has nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.senders.iter().all(|s| s.is_drained(&self.hal))
            && self.receivers.iter().all(|r| r.is_drained(&self.hal))
    }

    fn termination_signal(&self) -> TerminationSignal {
        self.hal.invalidate_local_view();
        self.termination.read(&self.hal).unwrap_or_default()
    }

    fn main_loop(&mut self) {
        let mut idle_batches = 0;
        loop {
            match self.termination_signal() {
                TerminationSignal::ImmediatelyTerminate => break,
                TerminationSignal::GracefullyTerminate if self.is_drained() => break,
                _ => {}
            }

            let progress = self.run_batch();
            if progress.is_empty() {
                idle_batches += 1;
                if idle_batches > self.config.switch_interval {
                    idle_batches = 0;
                    self.telemetry.context_switches += 1;
                    self.hal.context_switch();
                }
            } else {
                idle_batches = 0;
            }
        }
        info!(self.entity ; "main loop exited");
    }

    /// Step every serviced channel `iterations_between_ctx_switch` times.
    ///
    /// Sender and receiver channels are interleaved by index so that the
    /// worker channel and the first virtual channel always go first.
    pub fn run_batch(&mut self) -> Progress {
        let Self {
            hal,
            config,
            senders,
            sender_vcs,
            outbound,
            receivers,
            telemetry,
            ..
        } = self;
        let (hal, config) = (&*hal, &*config);
        let mut progress = Progress::NONE;
        for _ in 0..config.iterations_between_ctx_switch {
            hal.invalidate_local_view();
            for i in 0..senders.len().max(receivers.len()) {
                if let Some(sender) = senders.get_mut(i) {
                    let outbound = &mut outbound[sender_vcs[i]];
                    progress |= Progress::when(sender.step(hal, outbound), Progress::TX);
                }
                if let Some(receiver) = receivers.get_mut(i) {
                    progress |= Progress::when(receiver.step(hal), Progress::RX);
                }
            }
        }

        let tx_idle = senders.iter().all(|s| s.unsent(hal) == 0);
        let rx_idle = receivers
            .iter()
            .all(|r| hal.read_counter(streams::to_receiver_pkts_sent(r.vc())) == 0);
        telemetry.update(hal, progress, tx_idle, rx_idle, config.telemetry);
        progress
    }

    fn teardown(&mut self) {
        let hal = &self.hal;
        if let Some(worker_channel) = self.senders.iter().find(|s| s.channel() == 0) {
            worker_channel.connection().mark_loop_exited(hal);
        }

        self.sync_cores();
        for receiver in &self.receivers {
            handshake::wait_until(hal, |hal| receiver.all_transactions_flushed(hal));
        }

        self.sync_cores();
        if self.config.wait_for_host_signal
            && self.config.local_handshake_master
            && self.config.is_teardown_master()
        {
            let signal = self.termination_signal();
            handshake::notify_subordinates(
                hal,
                &self.wiring.local_edms,
                TERMINATION_SIGNAL_ADDR,
                signal as u32,
            );
        }
        hal.write_barrier();

        self.sync_cores();
        self.telemetry.sent = total(self.senders.iter().map(SenderChannel::stats));
        self.telemetry.received = total(self.receivers.iter().map(ReceiverChannel::stats));
        self.telemetry.report(&self.entity);
        if self.config.is_teardown_master() {
            self.set_status(EdmStatus::Terminated);
        }
    }
}

fn total(stats: impl Iterator<Item = ChannelStats>) -> ChannelStats {
    stats.fold(ChannelStats::default(), |acc, s| ChannelStats {
        packets: acc.packets + s.packets,
        bytes: acc.bytes + s.bytes,
    })
}

/// The producer adapters receiver channel `vc` forwards through.
fn downstream_senders(wiring: &RouterWiring, vc: usize) -> DownstreamSenders {
    let mut downstream = DownstreamSenders::default();
    if let Some(routers) = wiring.downstream.get(vc) {
        for direction in Direction::ALL {
            if let Some(endpoint) = routers[direction.index()] {
                downstream.routers[direction.index()] = Some(FabricSender::persistent(
                    endpoint,
                    streams::downstream_free_slots(vc, direction),
                ));
            }
        }
    }
    if let Some(Some(relay)) = wiring.local_relay.get(vc) {
        downstream.local_relay = Some(FabricSender::persistent(
            *relay,
            streams::local_relay_free_slots(vc),
        ));
    }
    downstream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WorkerConnectionAddrs;
    use crate::config::SenderChannelConfig;
    use crate::hal::{LocalMemory, NocInterface, StreamRegisters};
    use crate::header::{NocCommand, PacketHeader};
    use crate::layout::EdmMemoryMap;
    use crate::routing::{LineRouting, RoutingFields};
    use crate::test_helpers::{MockHal, test_entity};
    use crate::types::{L1Addr, NocAddr};

    const WORKER: L1Addr = 0x30000;
    const PAYLOAD: L1Addr = 0x31000;
    const DEST: L1Addr = 0x38000;

    fn loopback_config() -> RouterConfig {
        RouterConfig {
            slot_size_bytes: 256,
            enable_ethernet_handshake: false,
            ..RouterConfig::default()
        }
    }

    fn loopback_router(config: RouterConfig) -> Router<MockHal> {
        let mut router = Router::new(
            &test_entity(),
            "edm",
            MockHal::loopback(),
            config,
            RouterWiring::default(),
        )
        .unwrap();
        router.initialize();
        router
    }

    fn set_termination(router: &Router<MockHal>, signal: TerminationSignal) {
        TypedView::<TerminationSignal>::at(TERMINATION_SIGNAL_ADDR).write(router.hal(), &signal);
    }

    fn line(distance: u8) -> RoutingFields {
        RoutingFields::Line(LineRouting::unicast(distance).unwrap())
    }

    /// Write `count` packets of 32 bytes through a worker connection to
    /// sender channel `channel`, each destined for its own 32 bytes of DEST.
    fn inject(
        router: &Router<MockHal>,
        channel: usize,
        routing: RoutingFields,
        count: usize,
    ) -> FabricSender {
        let hal = router.hal();
        let map: EdmMemoryMap = router.config().memory_map();
        let mut worker = FabricSender::transient(
            map.endpoint(hal.my_core(), channel),
            WorkerConnectionAddrs::packed(WORKER),
        );
        worker.open(hal);
        for i in 0..count {
            let payload = PAYLOAD + (i * 32) as u32;
            hal.write_l1(payload, &[i as u8 + 1; 32]);
            let header = PacketHeader::new(
                NocCommand::UnicastWrite {
                    dest: NocAddr::new(hal.my_core(), DEST + (i * 32) as u32),
                },
                32,
                routing,
            );
            assert!(worker.has_space(hal));
            worker.send_packet(hal, &header, payload).unwrap();
        }
        worker
    }

    fn delivered(router: &Router<MockHal>, i: usize) -> [u8; 32] {
        let mut buf = [0; 32];
        router.hal().read_l1(DEST + (i * 32) as u32, &mut buf);
        buf
    }

    #[test]
    fn loopback_delivers_worker_packets() {
        let mut router = loopback_router(loopback_config());
        let worker = inject(&router, 0, line(1), 6);

        set_termination(&router, TerminationSignal::GracefullyTerminate);
        let telemetry = router.run().unwrap();

        for i in 0..6 {
            assert_eq!(delivered(&router, i), [i as u8 + 1; 32]);
        }
        assert_eq!(telemetry.sent.packets, 6);
        assert_eq!(telemetry.received.packets, 6);
        assert_eq!(router.status(), Ok(EdmStatus::Terminated));
        assert!(router.is_drained());
        // Every slot was handed back to the worker.
        assert_eq!(worker.free_slots(router.hal()), 8);
        let semaphore = router.config().memory_map().connection_semaphore(0);
        assert_eq!(TypedView::<u32>::at(semaphore).load(router.hal()), 99);
    }

    #[test]
    fn immediate_termination_leaves_work_behind() {
        let mut router = loopback_router(loopback_config());
        inject(&router, 0, line(1), 2);

        set_termination(&router, TerminationSignal::ImmediatelyTerminate);
        let telemetry = router.run().unwrap();
        assert_eq!(telemetry.batches, 0);
        assert_eq!(telemetry.sent.packets, 0);
        assert!(!router.is_drained());
        assert_eq!(router.status(), Ok(EdmStatus::Terminated));
    }

    #[test]
    fn second_virtual_channel_uses_its_own_receiver() {
        let config = RouterConfig {
            sender_channels: vec![
                SenderChannelConfig {
                    num_buffers: 4,
                    vc: 0,
                },
                SenderChannelConfig {
                    num_buffers: 4,
                    vc: 1,
                },
            ],
            receiver_num_buffers: vec![4, 4],
            ..loopback_config()
        };
        let mut router = loopback_router(config);
        // Channel 1 forwards, so the packet starts one hop further out.
        inject(&router, 1, line(2), 3);

        set_termination(&router, TerminationSignal::GracefullyTerminate);
        router.run().unwrap();

        for i in 0..3 {
            assert_eq!(delivered(&router, i), [i as u8 + 1; 32]);
        }
        assert_eq!(router.receivers()[0].stats().packets, 0);
        assert_eq!(router.receivers()[1].stats().packets, 3);
        assert_eq!(router.hal().read_counter(streams::to_receiver_pkts_sent(1)), 0);
    }

    #[test]
    fn batches_report_progress() {
        let mut router = loopback_router(loopback_config());
        assert_eq!(router.run_batch(), Progress::NONE);
        inject(&router, 0, line(1), 1);
        let progress = router.run_batch();
        assert!(progress.contains(Progress::TX | Progress::RX));
        assert!(router.is_drained());
        assert_eq!(router.telemetry().batches, 2);
    }

    #[test]
    fn first_level_ack_over_loopback() {
        let config = RouterConfig {
            first_level_ack: true,
            bubble_flow_control: true,
            fuse_flush_and_completion: false,
            ..loopback_config()
        };
        let mut router = loopback_router(config);
        inject(&router, 0, line(1), 8);
        set_termination(&router, TerminationSignal::GracefullyTerminate);
        let telemetry = router.run().unwrap();
        assert_eq!(telemetry.received.packets, 8);
        let pointers = router.senders()[0].pointers();
        assert_eq!(pointers.write.value(), 8);
        assert_eq!(pointers.ack.value(), 8);
        assert_eq!(pointers.completion.value(), 8);
    }

    #[test]
    fn two_core_router_splits_channels() {
        let config = RouterConfig {
            num_riscs: 2,
            risc_id: 1,
            receiver_txq: crate::types::TxqId(1),
            ..loopback_config()
        };
        let router: Router<MockHal> = Router::new(
            &test_entity(),
            "edm",
            MockHal::loopback(),
            config,
            RouterWiring::default(),
        )
        .unwrap();
        assert!(router.senders().is_empty());
        assert_eq!(router.receivers().len(), 1);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let config = RouterConfig {
            slot_size_bytes: 8,
            ..RouterConfig::default()
        };
        let result: FabricResult<Router<MockHal>> = Router::new(
            &test_entity(),
            "edm",
            MockHal::default(),
            config,
            RouterWiring::default(),
        );
        assert!(result.is_err());
    }
}
