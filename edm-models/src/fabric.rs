// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Build the chips of a [`Topology`] and the routers that join them.
//!
//! Every chip gets a router core for each direction it has a link in. The
//! receiver channel of each router forwards into the sender channel that the
//! other routers of the chip reserve for it:
//!
//! ```text
//!   sender channel of router `t` fed by router `d` = 1 + d.compact_index(t)
//! ```
//!
//! Only the first virtual channel carries forwarded traffic, a sender
//! channel takes a single producer so the second virtual channel of a
//! router can only be fed by workers.

use std::sync::Arc;

use edm_fabric::config::{RouterConfig, RouterWiring};
use edm_fabric::direction::{Direction, NUM_DIRECTIONS};
use edm_fabric::fabric_error;
use edm_fabric::layout::EdmEndpoint;
use edm_fabric::router::Router;
use edm_fabric::types::{CoreCoord, FabricError, FabricResult, TxqId};
use edm_track::entity::Entity;
use serde::{Deserialize, Serialize};

use crate::chip::{Chip, SINK_CORE, SimCore, edm_core, injector_core};
use crate::hal::{EthernetLink, SimHal};
use crate::topology::Topology;
use crate::worker::STAGING_ADDR;

/// Substrate settings shared by every chip of a fabric.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricOptions {
    /// Cores per router, the second one services the receiver channels.
    pub num_riscs: usize,
    /// Polls of a transaction id before its writes are reported flushed.
    pub flush_delay_polls: usize,
    pub sink_bytes: usize,
}

impl Default for FabricOptions {
    fn default() -> Self {
        Self {
            num_riscs: 1,
            flush_delay_polls: 2,
            sink_bytes: 1024 * 1024,
        }
    }
}

/// Everything needed to build the router running on one core.
#[derive(Clone, Debug)]
pub struct RouterSpec {
    pub chip: usize,
    pub direction: Direction,
    pub name: String,
    pub config: RouterConfig,
    pub wiring: RouterWiring,
}

pub struct Fabric {
    topology: Arc<dyn Topology>,
    config: RouterConfig,
    options: FabricOptions,
    chips: Vec<Arc<Chip>>,
}

impl Fabric {
    /// Lay out the chips. `config` is the template every router is built
    /// from, its placement and handshake roles are filled in per router.
    pub fn new(
        topology: Arc<dyn Topology>,
        config: RouterConfig,
        options: FabricOptions,
    ) -> FabricResult<Self> {
        topology.check_config(&config)?;
        config.validate()?;
        if options.num_riscs == 0 || options.num_riscs > 2 {
            fabric_error!(format!("{} cores per router", options.num_riscs));
        }

        let map = config.memory_map();
        let injector_bytes = STAGING_ADDR as usize + config.slot_size_bytes;
        let chips = (0..topology.num_chips())
            .map(|index| {
                let mut chip = Chip::new(index);
                for direction in topology.present_directions(index) {
                    chip.add_core(edm_core(direction), map.l1_size());
                    chip.add_core(injector_core(direction), injector_bytes);
                }
                chip.add_core(SINK_CORE, options.sink_bytes);
                Arc::new(chip)
            })
            .collect();

        Ok(Self {
            topology,
            config,
            options,
            chips,
        })
    }

    #[must_use]
    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[must_use]
    pub fn options(&self) -> &FabricOptions {
        &self.options
    }

    #[must_use]
    pub fn chips(&self) -> &[Arc<Chip>] {
        &self.chips
    }

    pub fn chip(&self, index: usize) -> FabricResult<&Arc<Chip>> {
        self.chips
            .get(index)
            .ok_or_else(|| FabricError(format!("no chip {index} in a {}", self.topology)))
    }

    pub fn core(&self, chip: usize, coord: CoreCoord) -> FabricResult<&Arc<SimCore>> {
        let chip = self.chip(chip)?;
        chip.core(coord)
            .ok_or_else(|| FabricError(format!("no core {coord} on {chip}")))
    }

    /// The router cores of `chip`, one per link.
    pub fn edm_cores(&self, chip: usize) -> FabricResult<Vec<Arc<SimCore>>> {
        self.topology
            .present_directions(chip)
            .into_iter()
            .map(|d| self.core(chip, edm_core(d)).cloned())
            .collect()
    }

    /// The router of `chip` the host releases, it releases the others.
    pub fn local_master(&self, chip: usize) -> FabricResult<Arc<SimCore>> {
        let direction = self
            .topology
            .present_directions(chip)
            .first()
            .copied()
            .ok_or_else(|| FabricError(format!("chip {chip} has no links")))?;
        self.core(chip, edm_core(direction)).cloned()
    }

    /// The configuration and wiring of every router core of the fabric.
    pub fn router_specs(&self) -> FabricResult<Vec<RouterSpec>> {
        let map = self.config.memory_map();
        let mut specs = Vec::new();
        for chip in 0..self.topology.num_chips() {
            let present = self.topology.present_directions(chip);
            let Some(master) = present.first().copied() else {
                continue;
            };
            for direction in present.iter().copied() {
                let neighbour = self.topology.neighbour(chip, direction).ok_or_else(|| {
                    FabricError(format!("chip {chip} lost its {direction} link"))
                })?;

                let mut downstream: [Option<EdmEndpoint>; NUM_DIRECTIONS] = [None; NUM_DIRECTIONS];
                let mut static_sender_channels = Vec::new();
                for other in present.iter().copied().filter(|t| *t != direction) {
                    downstream[other.index()] = Some(
                        map.endpoint(edm_core(other), feeding_channel(direction, other)?),
                    );
                    static_sender_channels.push(feeding_channel(other, direction)?);
                }
                let is_master = direction == master;
                let wiring = RouterWiring {
                    remote_receivers: Vec::new(),
                    downstream: vec![downstream],
                    local_relay: Vec::new(),
                    static_sender_channels,
                    local_edms: if is_master {
                        present
                            .iter()
                            .filter(|d| **d != master)
                            .map(|d| edm_core(*d))
                            .collect()
                    } else {
                        Vec::new()
                    },
                    local_master: (!is_master).then(|| edm_core(master)),
                };

                for risc_id in 0..self.options.num_riscs {
                    let config = RouterConfig {
                        my_direction: direction,
                        risc_id,
                        num_riscs: self.options.num_riscs,
                        enable_ethernet_handshake: true,
                        is_handshake_master: chip < neighbour,
                        local_handshake_master: is_master,
                        num_local_edms: present.len(),
                        wait_for_host_signal: true,
                        sender_txq: TxqId(0),
                        receiver_txq: TxqId((self.options.num_riscs - 1) as u8),
                        ..self.config.clone()
                    };
                    let name = if self.options.num_riscs == 1 {
                        format!("edm_{direction}")
                    } else {
                        format!("edm_{direction}_risc{risc_id}")
                    };
                    specs.push(RouterSpec {
                        chip,
                        direction,
                        name,
                        config,
                        wiring: wiring.clone(),
                    });
                }
            }
        }
        Ok(specs)
    }

    /// An entity per chip, parent of everything running on the chip.
    #[must_use]
    pub fn chip_entities(&self, parent: &Arc<Entity>) -> Vec<Arc<Entity>> {
        self.chips
            .iter()
            .map(|chip| Arc::new(Entity::new(parent, &chip.to_string())))
            .collect()
    }

    /// Build every router of the fabric, each on its own simulated core.
    pub fn build_routers(
        &self,
        chip_entities: &[Arc<Entity>],
    ) -> FabricResult<Vec<Router<SimHal>>> {
        let mut routers = Vec::new();
        for spec in self.router_specs()? {
            let chip = self.chip(spec.chip)?;
            let neighbour = self
                .topology
                .neighbour(spec.chip, spec.direction)
                .ok_or_else(|| {
                    FabricError(format!("chip {} has no {} link", spec.chip, spec.direction))
                })?;
            let link = EthernetLink {
                near: self.core(spec.chip, edm_core(spec.direction))?.clone(),
                far: self.core(neighbour, edm_core(spec.direction.opposite()))?.clone(),
            };
            let entity = chip_entities
                .get(spec.chip)
                .ok_or_else(|| FabricError(format!("no entity for chip {}", spec.chip)))?;
            let hal = SimHal::new(
                Arc::new(Entity::new(entity, &format!("{}_hal", spec.name))),
                chip.clone(),
                link.near.clone(),
                Some(link),
                self.options.flush_delay_polls,
            );
            routers.push(Router::new(
                entity,
                &spec.name,
                hal,
                spec.config,
                spec.wiring,
            )?);
        }
        Ok(routers)
    }
}

/// The sender channel of the router facing `to` that the router facing
/// `from` forwards into.
fn feeding_channel(from: Direction, to: Direction) -> FabricResult<usize> {
    from.compact_index(to)
        .map(|index| index + 1)
        .ok_or_else(|| FabricError(format!("the {from} router cannot forward into itself")))
}

#[cfg(test)]
mod tests {
    use edm_fabric::config::SenderChannelConfig;
    use edm_fabric::routing::RoutingMode;
    use edm_fabric::test_helpers::test_entity;

    use super::*;
    use crate::topology::{LineFabric, MeshFabric};

    fn line(num_chips: usize) -> Fabric {
        let topology = Arc::new(LineFabric::new(num_chips, RoutingMode::Line).unwrap());
        Fabric::new(topology, RouterConfig::default(), FabricOptions::default()).unwrap()
    }

    fn mesh_config() -> RouterConfig {
        RouterConfig {
            routing_mode: RoutingMode::Mesh,
            sender_channels: vec![
                SenderChannelConfig {
                    num_buffers: 4,
                    vc: 0
                };
                4
            ],
            ..RouterConfig::default()
        }
    }

    #[test]
    fn line_ends_have_a_single_router() {
        let fabric = line(3);
        let specs = fabric.router_specs().unwrap();
        assert_eq!(specs.len(), 4);
        let end = &specs[0];
        assert_eq!((end.chip, end.direction), (0, Direction::East));
        assert!(end.config.local_handshake_master);
        assert_eq!(end.config.num_local_edms, 1);
        assert!(end.wiring.static_sender_channels.is_empty());
        assert!(end.wiring.downstream[0].iter().all(Option::is_none));
    }

    #[test]
    fn middle_routers_forward_into_each_other() {
        let fabric = line(3);
        let specs = fabric.router_specs().unwrap();
        let east = specs
            .iter()
            .find(|s| s.chip == 1 && s.direction == Direction::East)
            .unwrap();
        let west = specs
            .iter()
            .find(|s| s.chip == 1 && s.direction == Direction::West)
            .unwrap();

        let into_west = east.wiring.downstream[0][Direction::West.index()].unwrap();
        assert_eq!(into_west.core, edm_core(Direction::West));
        assert_eq!(into_west.channel, 1);
        assert_eq!(west.wiring.static_sender_channels, vec![1]);

        assert!(east.config.is_handshake_master);
        assert!(!west.config.is_handshake_master);
        assert!(east.config.local_handshake_master);
        assert_eq!(west.wiring.local_master, Some(edm_core(Direction::East)));
        assert_eq!(east.wiring.local_edms, vec![edm_core(Direction::West)]);
    }

    #[test]
    fn mesh_channels_are_reserved_per_source() {
        let topology = Arc::new(MeshFabric::new(3, 3).unwrap());
        let fabric = Fabric::new(topology, mesh_config(), FabricOptions::default()).unwrap();
        let specs = fabric.router_specs().unwrap();
        let centre: Vec<&RouterSpec> = specs.iter().filter(|s| s.chip == 4).collect();
        assert_eq!(centre.len(), 4);
        for spec in &centre {
            let mut channels = spec.wiring.static_sender_channels.clone();
            channels.sort_unstable();
            assert_eq!(channels, vec![1, 2, 3]);
        }
        let south = centre
            .iter()
            .find(|s| s.direction == Direction::South)
            .unwrap();
        let into_east = south.wiring.downstream[0][Direction::East.index()].unwrap();
        assert_eq!(into_east.channel, 3);
    }

    #[test]
    fn two_cores_split_the_transmit_queues() {
        let topology = Arc::new(LineFabric::new(2, RoutingMode::Line).unwrap());
        let options = FabricOptions {
            num_riscs: 2,
            ..FabricOptions::default()
        };
        let fabric = Fabric::new(topology, RouterConfig::default(), options).unwrap();
        let specs = fabric.router_specs().unwrap();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[1].config.risc_id, 1);
        assert_eq!(specs[1].config.receiver_txq, TxqId(1));
        assert_eq!(specs[1].name, "edm_east_risc1");
    }

    #[test]
    fn mismatched_routing_is_rejected() {
        let topology = Arc::new(MeshFabric::new(2, 2).unwrap());
        assert!(Fabric::new(topology, RouterConfig::default(), FabricOptions::default()).is_err());
    }

    #[test]
    fn routers_are_built_on_their_cores() {
        let fabric = line(2);
        let routers = fabric
            .build_routers(&fabric.chip_entities(&test_entity()))
            .unwrap();
        assert_eq!(routers.len(), 2);
        assert_eq!(routers[0].entity.full_name(), "test::chip0::edm_east");
        assert_eq!(routers[1].hal().core().coord, edm_core(Direction::West));
        assert_eq!(fabric.edm_cores(0).unwrap().len(), 1);
        assert!(fabric.chip(2).is_err());
    }
}
