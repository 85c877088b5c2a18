// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Routing metadata carried in packet headers and the forwarding decisions
//! derived from it.
//!
//! Three encodings are supported:
//!  - [`LineRouting`]: a hop distance plus a multicast range for 1-D fabrics.
//!  - [`LowLatencyLineRouting`]: two bits per hop for 1-D fabrics.
//!  - [`MeshRouting`]: a buffer of per-hop [`HopCommand`]s for 2-D fabrics.
//!
//! A router decides what to do with a packet with [`RoutingFields::targets`]
//! and the next-hop header update is applied by the sender channel that
//! forwards the packet (see [`RoutingFields::advance_for_next_hop`]).

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::direction::{Direction, DirectionSet};
use crate::types::{FabricError, FabricResult};

/// Routing encoding used by a fabric.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    #[default]
    Line,
    LowLatencyLine,
    Mesh,
}

/// What a router does with a packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteTargets {
    pub local: bool,
    pub forward: DirectionSet,
}

impl RouteTargets {
    const LOCAL: RouteTargets = RouteTargets {
        local: true,
        forward: DirectionSet::EMPTY,
    };

    fn forward_to(directions: &[Direction], local: bool) -> Self {
        Self {
            local,
            forward: DirectionSet::of(directions),
        }
    }
}

/// Hop distance / multicast range routing for 1-D fabrics.
///
/// The low nibble is the distance to the first chip that writes the packet,
/// the high nibble the number of chips still to write it. Unicast packets
/// carry a range of one so that the terminal check is a single compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRouting(pub u8);

impl LineRouting {
    pub const HOP_DISTANCE_MASK: u8 = 0x0f;
    pub const LAST_HOP_DISTANCE_VAL: u8 = 1;
    pub const LAST_CHIP_IN_MULTICAST_VAL: u8 = 1 << 4;
    pub const LAST_MCAST_VAL: u8 = Self::LAST_CHIP_IN_MULTICAST_VAL | Self::LAST_HOP_DISTANCE_VAL;

    /// Route to the chip `distance` hops away.
    pub fn unicast(distance: u8) -> FabricResult<Self> {
        Self::multicast(distance, 1)
    }

    /// Route to `range` consecutive chips starting `start_distance` hops away.
    pub fn multicast(start_distance: u8, range: u8) -> FabricResult<Self> {
        if start_distance == 0 || start_distance > Self::HOP_DISTANCE_MASK {
            return Err(FabricError(format!(
                "line start distance {start_distance} out of range"
            )));
        }
        if range == 0 || range > 0x0f {
            return Err(FabricError(format!("line multicast range {range} out of range")));
        }
        Ok(Self((range << 4) | start_distance))
    }

    #[must_use]
    pub fn targets(self) -> RouteTargets {
        RouteTargets {
            local: self.0 & Self::HOP_DISTANCE_MASK == Self::LAST_HOP_DISTANCE_VAL,
            // The forward direction is resolved by the router.
            forward: DirectionSet::EMPTY,
        }
    }

    /// Both the distance and the range nibble are non-zero.
    #[must_use]
    pub fn is_well_formed(self) -> bool {
        self.0 & Self::HOP_DISTANCE_MASK != 0 && self.0 >> 4 != 0
    }

    #[must_use]
    pub fn must_forward(self) -> bool {
        self.0 != Self::LAST_MCAST_VAL
    }

    #[must_use]
    pub fn next_hop(self) -> Self {
        if self.0 & Self::HOP_DISTANCE_MASK != Self::LAST_HOP_DISTANCE_VAL {
            Self(self.0.wrapping_sub(1))
        } else {
            Self(self.0.wrapping_sub(Self::LAST_CHIP_IN_MULTICAST_VAL))
        }
    }
}

/// Per-hop action of a [`LowLatencyLineRouting`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum LineHop {
    WriteOnly = 0b01,
    ForwardOnly = 0b10,
    WriteAndForward = 0b11,
}

/// Two bits per hop, least significant first, for 1-D fabrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LowLatencyLineRouting(pub u32);

impl LowLatencyLineRouting {
    pub const FIELD_WIDTH: u32 = 2;
    pub const FIELD_MASK: u32 = 0b11;
    pub const MAX_HOPS: usize = 16;

    pub fn from_hops(hops: &[LineHop]) -> FabricResult<Self> {
        if hops.is_empty() || hops.len() > Self::MAX_HOPS {
            return Err(FabricError(format!("{} low latency hops", hops.len())));
        }
        let value = hops
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, hop)| {
                acc | ((*hop as u32) << (i as u32 * Self::FIELD_WIDTH))
            });
        Ok(Self(value))
    }

    /// Write on the chip `distance` hops away.
    pub fn unicast(distance: usize) -> FabricResult<Self> {
        let mut hops = vec![LineHop::ForwardOnly; distance.saturating_sub(1)];
        hops.push(LineHop::WriteOnly);
        Self::from_hops(&hops)
    }

    /// Write on `range` consecutive chips starting `start_distance` hops away.
    pub fn multicast(start_distance: usize, range: usize) -> FabricResult<Self> {
        if start_distance == 0 || range == 0 {
            return Err(FabricError("empty low latency multicast".to_string()));
        }
        let mut hops = vec![LineHop::ForwardOnly; start_distance - 1];
        hops.extend(std::iter::repeat_n(LineHop::WriteAndForward, range - 1));
        hops.push(LineHop::WriteOnly);
        Self::from_hops(&hops)
    }

    #[must_use]
    pub fn hop(self) -> Option<LineHop> {
        LineHop::from_u32(self.0 & Self::FIELD_MASK)
    }

    #[must_use]
    pub fn next_hop(self) -> Self {
        Self(self.0 >> Self::FIELD_WIDTH)
    }
}

/// A mesh hop command, four bits in the route buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum HopCommand {
    Noop = 0x0,
    ForwardEast = 0x1,
    ForwardWest = 0x2,
    WriteAndForwardEw = 0x3,
    ForwardNorth = 0x4,
    ForwardSouth = 0x8,
    WriteAndForwardNs = 0xc,
    WriteAndForwardNsew = 0xf,
    WriteAndForwardNse = 0xd,
    WriteAndForwardNsw = 0xe,
    WriteAndForwardNew = 0x7,
    WriteAndForwardSew = 0xb,
    WriteAndForwardNe = 0x5,
    WriteAndForwardNw = 0x6,
    WriteAndForwardSe = 0x9,
    WriteAndForwardSw = 0xa,
}

impl HopCommand {
    /// Resolve the command for the router whose link faces `me`.
    ///
    /// Trunk (north/south) continuation is relative to where the packet came
    /// from, east/west branches always leave through the east/west routers.
    /// The router never forwards back out of its own link.
    #[must_use]
    pub fn targets(self, me: Direction) -> RouteTargets {
        use Direction::*;

        let forward = |d: Direction| {
            if d == me {
                RouteTargets::LOCAL
            } else {
                RouteTargets::forward_to(&[d], false)
            }
        };
        let trunk = if me == South { North } else { South };

        let mut targets = match self {
            HopCommand::Noop => RouteTargets::default(),
            HopCommand::ForwardEast => forward(East),
            HopCommand::ForwardWest => forward(West),
            HopCommand::ForwardNorth => forward(North),
            HopCommand::ForwardSouth => forward(South),
            HopCommand::WriteAndForwardEw => {
                RouteTargets::forward_to(&[if me == West { East } else { West }], true)
            }
            HopCommand::WriteAndForwardNs => RouteTargets::forward_to(&[trunk], true),
            HopCommand::WriteAndForwardNsew => RouteTargets::forward_to(&[trunk, East, West], true),
            HopCommand::WriteAndForwardNse => RouteTargets::forward_to(&[trunk, East], true),
            HopCommand::WriteAndForwardNsw => RouteTargets::forward_to(&[trunk, West], true),
            HopCommand::WriteAndForwardNew
            | HopCommand::WriteAndForwardNe
            | HopCommand::WriteAndForwardNw => {
                // The trunk runs north, its last hop writes.
                if me == South {
                    RouteTargets::forward_to(&[North], false)
                } else {
                    RouteTargets::LOCAL
                }
            }
            HopCommand::WriteAndForwardSew
            | HopCommand::WriteAndForwardSe
            | HopCommand::WriteAndForwardSw => {
                // The trunk runs south, its last hop writes.
                if me == North {
                    RouteTargets::forward_to(&[South], false)
                } else {
                    RouteTargets::LOCAL
                }
            }
        };

        match self {
            HopCommand::WriteAndForwardNew | HopCommand::WriteAndForwardSew => {
                targets.forward.insert(East);
                targets.forward.insert(West);
            }
            HopCommand::WriteAndForwardNe | HopCommand::WriteAndForwardSe => {
                targets.forward.insert(East);
            }
            HopCommand::WriteAndForwardNw | HopCommand::WriteAndForwardSw => {
                targets.forward.insert(West);
            }
            _ => {}
        }
        targets.forward.remove(me);
        targets
    }
}

/// Routing for 2-D fabrics: one command per hop, indexed by `hop_index`.
///
/// Multicast branches leaving the trunk restart at `branch_east_offset` or
/// `branch_west_offset` in the route buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshRouting {
    pub hop_index: u8,
    pub branch_east_offset: u8,
    pub branch_west_offset: u8,
    route_buffer: [u8; MeshRouting::ROUTE_BUFFER_BYTES],
}

impl MeshRouting {
    pub const ROUTE_BUFFER_BYTES: usize = 16;
    pub const MAX_HOPS: usize = 2 * Self::ROUTE_BUFFER_BYTES;

    pub fn from_commands(commands: &[HopCommand]) -> FabricResult<Self> {
        if commands.len() > Self::MAX_HOPS {
            return Err(FabricError(format!("{} mesh hops", commands.len())));
        }
        let mut route_buffer = [0u8; Self::ROUTE_BUFFER_BYTES];
        for (i, command) in commands.iter().enumerate() {
            route_buffer[i / 2] |= (*command as u8) << ((i % 2) * 4);
        }
        Ok(Self {
            hop_index: 0,
            branch_east_offset: 0,
            branch_west_offset: 0,
            route_buffer,
        })
    }

    /// Unicast along `path`, where `path[0]` is the link the producer sends
    /// on and each following entry the link taken by the next router.
    ///
    /// A router turning traffic from a north/south link onto an east/west
    /// one restarts it at a branch offset, so the offset of that side points
    /// just past the turn.
    pub fn unicast(path: &[Direction]) -> FabricResult<Self> {
        let Some(last) = path.last() else {
            return Err(FabricError("empty mesh path".to_string()));
        };
        let mut commands: Vec<HopCommand> = path[1..].iter().map(|d| Self::forward(*d)).collect();
        // The final router faces back along the last link, forwarding
        // "towards itself" writes locally.
        commands.push(Self::forward(last.opposite()));
        let mut routing = Self::from_commands(&commands)?;

        let mut east = None;
        let mut west = None;
        for (j, hop) in path.windows(2).enumerate() {
            if hop[0].is_spine() && !hop[1].is_spine() {
                let offset = if hop[1] == Direction::East {
                    &mut east
                } else {
                    &mut west
                };
                if offset.is_some() {
                    return Err(FabricError(format!(
                        "mesh path turns {} twice",
                        hop[1]
                    )));
                }
                *offset = Some((j + 1) as u8);
            }
        }
        routing.branch_east_offset = east.unwrap_or_default();
        routing.branch_west_offset = west.unwrap_or_default();
        Ok(routing)
    }

    /// Multicast to a rectangle: a trunk of `trunk` commands whose routers
    /// branch east and west, each branch following `east` or `west`.
    pub fn multicast(
        trunk: &[HopCommand],
        east: &[HopCommand],
        west: &[HopCommand],
    ) -> FabricResult<Self> {
        let mut commands = trunk.to_vec();
        let branch_east_offset = commands.len();
        commands.extend_from_slice(east);
        let branch_west_offset = commands.len();
        commands.extend_from_slice(west);
        let mut routing = Self::from_commands(&commands)?;
        routing.branch_east_offset = branch_east_offset as u8;
        routing.branch_west_offset = branch_west_offset as u8;
        Ok(routing)
    }

    fn forward(direction: Direction) -> HopCommand {
        match direction {
            Direction::East => HopCommand::ForwardEast,
            Direction::West => HopCommand::ForwardWest,
            Direction::North => HopCommand::ForwardNorth,
            Direction::South => HopCommand::ForwardSouth,
        }
    }

    /// The command for the current hop.
    pub fn command(&self) -> FabricResult<HopCommand> {
        let index = self.hop_index as usize;
        if index >= Self::MAX_HOPS {
            return Err(FabricError(format!("hop index {index} past route buffer")));
        }
        let nibble = (self.route_buffer[index / 2] >> ((index % 2) * 4)) & 0x0f;
        HopCommand::from_u8(nibble).ok_or_else(|| FabricError(format!("bad hop command {nibble}")))
    }

    /// Header update applied by a router forwarding the packet on.
    ///
    /// `turn` is set when an east/west router forwards traffic that arrived
    /// from a north/south router, the packet then joins a branch.
    #[must_use]
    pub fn next_hop(self, sender_direction: Direction, turn: bool) -> Self {
        let mut next = self;
        if turn {
            next.hop_index = if sender_direction == Direction::East {
                self.branch_east_offset
            } else {
                self.branch_west_offset
            };
        } else {
            next.hop_index = self.hop_index.wrapping_add(1);
        }
        next
    }

    #[must_use]
    pub fn route_buffer(&self) -> &[u8; Self::ROUTE_BUFFER_BYTES] {
        &self.route_buffer
    }

    #[must_use]
    pub fn with_route_buffer(
        hop_index: u8,
        branch_east_offset: u8,
        branch_west_offset: u8,
        route_buffer: [u8; Self::ROUTE_BUFFER_BYTES],
    ) -> Self {
        Self {
            hop_index,
            branch_east_offset,
            branch_west_offset,
            route_buffer,
        }
    }
}

/// Routing metadata of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingFields {
    Line(LineRouting),
    LowLatencyLine(LowLatencyLineRouting),
    Mesh(MeshRouting),
}

impl RoutingFields {
    #[must_use]
    pub fn mode(&self) -> RoutingMode {
        match self {
            RoutingFields::Line(_) => RoutingMode::Line,
            RoutingFields::LowLatencyLine(_) => RoutingMode::LowLatencyLine,
            RoutingFields::Mesh(_) => RoutingMode::Mesh,
        }
    }

    /// Decide what the router facing `me` does with the packet.
    ///
    /// Line fabrics continue straight through the chip: a packet that came
    /// in on `me` leaves on the opposite link.
    pub fn targets(&self, me: Direction) -> FabricResult<RouteTargets> {
        let straight_on = DirectionSet::of(&[me.opposite()]);
        match self {
            RoutingFields::Line(line) => {
                if !line.is_well_formed() {
                    return Err(FabricError(format!("malformed line route {:#04x}", line.0)));
                }
                let mut targets = line.targets();
                if line.must_forward() {
                    targets.forward = straight_on;
                }
                Ok(targets)
            }
            RoutingFields::LowLatencyLine(line) => match line.hop() {
                Some(LineHop::WriteOnly) => Ok(RouteTargets::LOCAL),
                Some(LineHop::ForwardOnly) => Ok(RouteTargets {
                    local: false,
                    forward: straight_on,
                }),
                Some(LineHop::WriteAndForward) => Ok(RouteTargets {
                    local: true,
                    forward: straight_on,
                }),
                None => Err(FabricError(format!(
                    "low latency route {:#x} has no hops left",
                    line.0
                ))),
            },
            RoutingFields::Mesh(mesh) => Ok(mesh.command()?.targets(me)),
        }
    }

    /// Header update applied when a router's sender channel forwards the
    /// packet to the next chip.
    #[must_use]
    pub fn advance_for_next_hop(self, sender_direction: Direction, turn: bool) -> Self {
        match self {
            RoutingFields::Line(line) => RoutingFields::Line(line.next_hop()),
            RoutingFields::LowLatencyLine(line) => RoutingFields::LowLatencyLine(line.next_hop()),
            RoutingFields::Mesh(mesh) => RoutingFields::Mesh(mesh.next_hop(sender_direction, turn)),
        }
    }
}
