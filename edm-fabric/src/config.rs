// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Router configuration.
//!
//! Every constant that selects the behaviour of a router is held in a
//! [`RouterConfig`] resolved once when the router is built. Where the router
//! sits in the fabric (the routers and relays it forwards to, the other
//! routers of its chip) is described separately by a [`RouterWiring`].
//!
//! Configurations are layered with [`figment`]: defaults, then an optional
//! TOML file, then `EDM_` prefixed environment variables.

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::direction::{Direction, NUM_DIRECTIONS};
use crate::fabric_error;
use crate::header::HEADER_SIZE_BYTES;
use crate::layout::{
    EdmEndpoint, EdmMemoryMap, MAX_BUFFERS_PER_CHANNEL, MAX_RECEIVER_CHANNELS, MAX_SENDER_CHANNELS,
};
use crate::routing::RoutingMode;
use crate::types::{CoreCoord, FabricResult, L1Addr, TxqId};

/// Hardware transaction ids available to the receiver channels.
pub const NUM_HARDWARE_TRANSACTION_IDS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderChannelConfig {
    pub num_buffers: usize,
    /// The virtual channel (remote receiver channel) this channel feeds.
    pub vc: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub routing_mode: RoutingMode,
    /// Direction the link of this router leaves the chip in.
    pub my_direction: Direction,
    pub slot_size_bytes: usize,
    /// Channel 0 is fed by workers, the others by the routers of the chip.
    pub sender_channels: Vec<SenderChannelConfig>,
    /// Buffers of each receiver channel, one per virtual channel.
    pub receiver_num_buffers: Vec<usize>,

    /// Channels serviced by this router, bit `i` for channel `i`.
    pub sender_channel_mask: u32,
    pub receiver_channel_mask: u32,
    /// With two cores per router core 0 services the sender channels and
    /// core 1 the receiver channels.
    pub risc_id: usize,
    pub num_riscs: usize,

    pub first_level_ack: bool,
    pub fuse_flush_and_completion: bool,
    pub trid_flush_check: bool,
    pub bubble_flow_control: bool,
    pub bubble_min_free_slots: usize,

    /// Inner loop iterations between termination checks.
    pub iterations_between_ctx_switch: usize,
    /// Idle outer iterations before giving the background routine a turn.
    pub switch_interval: usize,

    pub num_transaction_ids: usize,
    pub transaction_id_base: usize,

    /// Off for links whose peer is known to be up, such as a loopback.
    pub enable_ethernet_handshake: bool,
    /// Starts the link handshake, the peer replies.
    pub is_handshake_master: bool,
    pub local_handshake_master: bool,
    /// Routers on this chip taking part in the local handshake.
    pub num_local_edms: usize,
    pub wait_for_host_signal: bool,

    pub sender_txq: TxqId,
    pub receiver_txq: TxqId,
    /// Spin on a busy transmit queue instead of retrying the step later.
    pub spin_wait: bool,
    pub telemetry: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routing_mode: RoutingMode::Line,
            my_direction: Direction::East,
            slot_size_bytes: 4096 + HEADER_SIZE_BYTES,
            sender_channels: vec![
                SenderChannelConfig {
                    num_buffers: 8,
                    vc: 0,
                },
                SenderChannelConfig {
                    num_buffers: 8,
                    vc: 0,
                },
            ],
            receiver_num_buffers: vec![16],
            sender_channel_mask: u32::MAX,
            receiver_channel_mask: u32::MAX,
            risc_id: 0,
            num_riscs: 1,
            first_level_ack: false,
            fuse_flush_and_completion: true,
            trid_flush_check: false,
            bubble_flow_control: false,
            bubble_min_free_slots: 2,
            iterations_between_ctx_switch: 32,
            switch_interval: 0,
            num_transaction_ids: 4,
            transaction_id_base: 0,
            enable_ethernet_handshake: true,
            is_handshake_master: true,
            local_handshake_master: true,
            num_local_edms: 1,
            wait_for_host_signal: false,
            sender_txq: TxqId(0),
            receiver_txq: TxqId(0),
            spin_wait: true,
            telemetry: false,
        }
    }
}

impl RouterConfig {
    /// Layer a TOML file (when given) and `EDM_` environment variables over
    /// the defaults.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(RouterConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("EDM_"))
    }

    pub fn load(path: Option<&Path>) -> FabricResult<Self> {
        let config: RouterConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants a router relies on.
    pub fn validate(&self) -> FabricResult {
        let num_senders = self.sender_channels.len();
        let num_receivers = self.receiver_num_buffers.len();
        if num_senders == 0 || num_senders > MAX_SENDER_CHANNELS {
            fabric_error!(format!(
                "{num_senders} sender channels, between 1 and {MAX_SENDER_CHANNELS} supported"
            ));
        }
        if num_receivers == 0 || num_receivers > MAX_RECEIVER_CHANNELS {
            fabric_error!(format!(
                "{num_receivers} receiver channels, between 1 and {MAX_RECEIVER_CHANNELS} supported"
            ));
        }
        let buffers = self
            .sender_channels
            .iter()
            .map(|c| c.num_buffers)
            .chain(self.receiver_num_buffers.iter().copied());
        for num_buffers in buffers {
            if num_buffers == 0 || num_buffers > MAX_BUFFERS_PER_CHANNEL {
                fabric_error!(format!(
                    "{num_buffers} buffers, between 1 and {MAX_BUFFERS_PER_CHANNEL} supported"
                ));
            }
        }
        if self.slot_size_bytes < HEADER_SIZE_BYTES || self.slot_size_bytes % 16 != 0 {
            fabric_error!(format!(
                "slot size {} must be a multiple of 16 holding a {HEADER_SIZE_BYTES} byte header",
                self.slot_size_bytes
            ));
        }
        if let Some(channel) = self
            .sender_channels
            .iter()
            .position(|c| c.vc >= num_receivers)
        {
            fabric_error!(format!(
                "sender channel {channel} feeds virtual channel {} of {num_receivers}",
                self.sender_channels[channel].vc
            ));
        }

        let min_senders = match self.routing_mode {
            RoutingMode::Mesh => NUM_DIRECTIONS,
            RoutingMode::Line | RoutingMode::LowLatencyLine => 2,
        };
        if num_senders < min_senders {
            fabric_error!(format!(
                "{:?} routing needs {min_senders} sender channels, {num_senders} configured",
                self.routing_mode
            ));
        }

        if self.bubble_flow_control {
            if !self.first_level_ack {
                fabric_error!("bubble flow control requires first level ack");
            }
            if self.bubble_min_free_slots == 0
                || self.bubble_min_free_slots > self.receiver_num_buffers[0]
            {
                fabric_error!(format!(
                    "bubble of {} slots does not fit {} remote buffers",
                    self.bubble_min_free_slots, self.receiver_num_buffers[0]
                ));
            }
        }

        if self.iterations_between_ctx_switch == 0 {
            fabric_error!("iterations_between_ctx_switch must be non-zero");
        }
        if self.num_transaction_ids == 0
            || self.transaction_id_base + self.num_transaction_ids > NUM_HARDWARE_TRANSACTION_IDS
        {
            fabric_error!(format!(
                "transaction ids {}..{} outside the {NUM_HARDWARE_TRANSACTION_IDS} available",
                self.transaction_id_base,
                self.transaction_id_base + self.num_transaction_ids
            ));
        }

        if self.num_riscs == 0 || self.num_riscs > 2 || self.risc_id >= self.num_riscs {
            fabric_error!(format!(
                "core {} of {} cores per router",
                self.risc_id, self.num_riscs
            ));
        }
        if self.num_local_edms == 0 {
            fabric_error!("num_local_edms must be non-zero");
        }
        if self.sender_txq.0 > 1 || self.receiver_txq.0 > 1 {
            fabric_error!("only transmit queues 0 and 1 exist");
        }
        if self.num_riscs == 1 && self.sender_txq != self.receiver_txq {
            fabric_error!("a single core router sends on one transmit queue");
        }
        Ok(())
    }

    #[must_use]
    pub fn num_sender_channels(&self) -> usize {
        self.sender_channels.len()
    }

    #[must_use]
    pub fn num_receiver_channels(&self) -> usize {
        self.receiver_num_buffers.len()
    }

    #[must_use]
    pub fn is_sender_serviced(&self, channel: usize) -> bool {
        self.sender_channel_mask & (1 << channel) != 0 && (self.num_riscs == 1 || self.risc_id == 0)
    }

    #[must_use]
    pub fn is_receiver_serviced(&self, vc: usize) -> bool {
        self.receiver_channel_mask & (1 << vc) != 0
            && (self.num_riscs == 1 || self.risc_id == self.num_riscs - 1)
    }

    /// The core that performs the link and local handshakes and writes the
    /// final status.
    #[must_use]
    pub fn is_teardown_master(&self) -> bool {
        self.risc_id == 0
    }

    #[must_use]
    pub fn memory_map(&self) -> EdmMemoryMap {
        let senders: Vec<usize> = self.sender_channels.iter().map(|c| c.num_buffers).collect();
        EdmMemoryMap::new(self.slot_size_bytes, &senders, &self.receiver_num_buffers)
    }
}

/// A receive buffer of the router at the other end of the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReceiver {
    pub buffer_base: L1Addr,
    pub num_buffers: usize,
}

/// Where a router sits in the fabric.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterWiring {
    /// Receiver channels of the peer, one per virtual channel. Left empty
    /// the peer is assumed to share this router's geometry.
    pub remote_receivers: Vec<RemoteReceiver>,
    /// Per virtual channel, the sender channel of the router of each
    /// direction of this chip that packets are forwarded into.
    pub downstream: Vec<[Option<EdmEndpoint>; NUM_DIRECTIONS]>,
    /// Per virtual channel, the relay local deliveries go through.
    pub local_relay: Vec<Option<EdmEndpoint>>,
    /// Sender channels fed by another router of this chip. Their persistent
    /// connections are waited for before traffic starts.
    pub static_sender_channels: Vec<usize>,
    /// The other routers of the chip, notified by the local handshake master.
    pub local_edms: Vec<CoreCoord>,
    /// The local handshake master, notified by the other routers.
    pub local_master: Option<CoreCoord>,
}

impl RouterWiring {
    /// Check the wiring against the configuration of the router it wires.
    pub fn validate(&self, config: &RouterConfig) -> FabricResult {
        let num_receivers = config.num_receiver_channels();
        if !self.remote_receivers.is_empty() && self.remote_receivers.len() != num_receivers {
            fabric_error!(format!(
                "{} remote receivers for {num_receivers} virtual channels",
                self.remote_receivers.len()
            ));
        }
        if self.downstream.len() > num_receivers || self.local_relay.len() > num_receivers {
            fabric_error!("downstream wiring for more virtual channels than configured");
        }
        for (vc, routers) in self.downstream.iter().enumerate() {
            let own = &routers[config.my_direction.index()];
            if own.is_some() {
                fabric_error!(format!(
                    "virtual channel {vc} forwards back into its own direction {}",
                    config.my_direction
                ));
            }
            for endpoint in routers.iter().flatten() {
                if endpoint.slot_size_bytes < config.slot_size_bytes {
                    fabric_error!(format!(
                        "downstream slots of {} bytes cannot hold {} byte packets",
                        endpoint.slot_size_bytes, config.slot_size_bytes
                    ));
                }
            }
        }
        for channel in &self.static_sender_channels {
            if *channel == 0 || *channel >= config.num_sender_channels() {
                fabric_error!(format!(
                    "sender channel {channel} cannot take a router to router connection"
                ));
            }
        }
        if config.wait_for_host_signal
            && !config.local_handshake_master
            && self.local_master.is_none()
        {
            fabric_error!("a local handshake subordinate needs its master");
        }
        Ok(())
    }

    /// The peer's receive buffer of virtual channel `vc`.
    #[must_use]
    pub fn remote_receiver(&self, vc: usize, map: &EdmMemoryMap) -> RemoteReceiver {
        self.remote_receivers
            .get(vc)
            .copied()
            .unwrap_or_else(|| RemoteReceiver {
                buffer_base: map.receiver_buffer_base(vc),
                num_buffers: map.receiver_num_buffers(vc),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh() -> RouterConfig {
        RouterConfig {
            routing_mode: RoutingMode::Mesh,
            sender_channels: vec![
                SenderChannelConfig {
                    num_buffers: 8,
                    vc: 0
                };
                4
            ],
            ..RouterConfig::default()
        }
    }

    #[test]
    fn default_is_valid() {
        RouterConfig::default().validate().unwrap();
        mesh().validate().unwrap();
    }

    #[test]
    fn mesh_needs_a_channel_per_direction() {
        let config = RouterConfig {
            routing_mode: RoutingMode::Mesh,
            ..RouterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut config = RouterConfig::default();
        config.slot_size_bytes = 100;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.receiver_num_buffers = vec![65];
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.sender_channels[1].vc = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bubble_flow_control_needs_first_level_ack() {
        let mut config = RouterConfig::default();
        config.bubble_flow_control = true;
        assert!(config.validate().is_err());
        config.first_level_ack = true;
        config.validate().unwrap();
    }

    #[test]
    fn transaction_ids_stay_in_hardware_range() {
        let mut config = RouterConfig::default();
        config.transaction_id_base = 14;
        assert!(config.validate().is_err());
        config.num_transaction_ids = 2;
        config.validate().unwrap();
    }

    #[test]
    fn two_cores_split_the_channels() {
        let mut config = RouterConfig::default();
        config.num_riscs = 2;
        config.receiver_txq = TxqId(1);
        config.validate().unwrap();
        assert!(config.is_sender_serviced(1));
        assert!(!config.is_receiver_serviced(0));

        config.risc_id = 1;
        assert!(!config.is_sender_serviced(0));
        assert!(config.is_receiver_serviced(0));
        assert!(!config.is_teardown_master());
    }

    #[test]
    fn masks_select_channels() {
        let mut config = RouterConfig::default();
        config.sender_channel_mask = 0b10;
        assert!(!config.is_sender_serviced(0));
        assert!(config.is_sender_serviced(1));
    }

    #[test]
    fn own_direction_is_never_downstream() {
        let config = RouterConfig::default();
        let map = config.memory_map();
        let mut routers = [None; NUM_DIRECTIONS];
        routers[Direction::East.index()] = Some(map.endpoint(CoreCoord::new(1, 0), 1));
        let wiring = RouterWiring {
            downstream: vec![routers],
            ..RouterWiring::default()
        };
        assert!(wiring.validate(&config).is_err());
    }

    #[test]
    fn remote_receivers_default_to_own_geometry() {
        let config = RouterConfig::default();
        let map = config.memory_map();
        let remote = RouterWiring::default().remote_receiver(0, &map);
        assert_eq!(remote.buffer_base, map.receiver_buffer_base(0));
        assert_eq!(remote.num_buffers, 16);
    }
}
