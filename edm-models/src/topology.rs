// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The shapes of fabric that routers are composed into and the routes
//! packets take through them.
//!
//! A [`Topology`] knows which chip sits on the other end of each link and
//! turns a source and its destinations into a [`Route`]: the link the packet
//! is injected on and the routing fields of its header.

use std::fmt;

use edm_fabric::config::RouterConfig;
use edm_fabric::direction::Direction;
use edm_fabric::fabric_error;
use edm_fabric::routing::{
    HopCommand, LineRouting, LowLatencyLineRouting, MeshRouting, RoutingFields, RoutingMode,
};
use edm_fabric::types::{FabricError, FabricResult};

/// How a packet leaves its source chip and which chips write it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// The link of the source chip the packet is injected on.
    pub direction: Direction,
    pub routing: RoutingFields,
    pub destinations: Vec<usize>,
}

pub trait Topology: fmt::Display + Send + Sync {
    fn num_chips(&self) -> usize;

    /// The directions routers can face in this topology.
    fn link_directions(&self) -> &[Direction];

    /// The chip at the other end of the link leaving `chip` in `direction`.
    fn neighbour(&self, chip: usize, direction: Direction) -> Option<usize>;

    /// The links taken from `src` to `dst`, one entry per hop.
    fn path(&self, src: usize, dst: usize) -> FabricResult<Vec<Direction>>;

    fn routing_mode(&self) -> RoutingMode;

    /// Every other chip reached from `src`, as few routes as possible.
    fn broadcast(&self, src: usize) -> FabricResult<Vec<Route>>;

    /// Check that routers configured by `config` can run this topology.
    fn check_config(&self, config: &RouterConfig) -> FabricResult {
        if config.routing_mode != self.routing_mode()
            && !(is_line(config.routing_mode) && is_line(self.routing_mode()))
        {
            fabric_error!(format!(
                "{self} cannot be routed with {:?} routing",
                config.routing_mode
            ));
        }
        Ok(())
    }

    /// The directions `chip` has a link in.
    fn present_directions(&self, chip: usize) -> Vec<Direction> {
        self.link_directions()
            .iter()
            .copied()
            .filter(|d| self.neighbour(chip, *d).is_some())
            .collect()
    }

    /// `range` consecutive chips along `direction`, the first of them
    /// `start_distance` hops from `src`.
    fn straight_line(
        &self,
        src: usize,
        direction: Direction,
        start_distance: usize,
        range: usize,
    ) -> FabricResult<Route> {
        if start_distance == 0 || range == 0 {
            fabric_error!(format!(
                "empty line route from chip {src}: start {start_distance}, range {range}"
            ));
        }
        let mut chip = src;
        let mut destinations = Vec::with_capacity(range);
        for hop in 1..start_distance + range {
            chip = self.neighbour(chip, direction).ok_or_else(|| {
                FabricError(format!(
                    "{self} ends {} hops {direction} of chip {src}",
                    hop - 1
                ))
            })?;
            if hop >= start_distance {
                destinations.push(chip);
            }
        }

        let routing = match self.routing_mode() {
            RoutingMode::Line => RoutingFields::Line(LineRouting::multicast(
                narrow(start_distance)?,
                narrow(range)?,
            )?),
            RoutingMode::LowLatencyLine => RoutingFields::LowLatencyLine(
                LowLatencyLineRouting::multicast(start_distance, range)?,
            ),
            RoutingMode::Mesh => {
                RoutingFields::Mesh(MeshRouting::from_commands(&straight_line_commands(
                    direction,
                    start_distance,
                    range,
                ))?)
            }
        };
        Ok(Route {
            direction,
            routing,
            destinations,
        })
    }

    fn unicast(&self, src: usize, dst: usize) -> FabricResult<Route> {
        let path = self.path(src, dst)?;
        let Some(first) = path.first().copied() else {
            fabric_error!(format!("chip {src} cannot send to itself"));
        };
        if path.iter().all(|d| *d == first) {
            return self.straight_line(src, first, path.len(), 1);
        }
        if self.routing_mode() != RoutingMode::Mesh {
            fabric_error!(format!("{self} path from chip {src} to {dst} turns"));
        }
        Ok(Route {
            direction: first,
            routing: RoutingFields::Mesh(MeshRouting::unicast(&path)?),
            destinations: vec![dst],
        })
    }
}

fn is_line(mode: RoutingMode) -> bool {
    matches!(mode, RoutingMode::Line | RoutingMode::LowLatencyLine)
}

fn narrow(value: usize) -> FabricResult<u8> {
    u8::try_from(value).map_err(|_| FabricError(format!("{value} hops do not fit a line route")))
}

/// Hop commands of a mesh packet travelling straight in `direction`.
///
/// Every hop arrives at the router facing back the way the packet came, so
/// the last hop "forwards" back out of that router, which writes locally.
fn straight_line_commands(
    direction: Direction,
    start_distance: usize,
    range: usize,
) -> Vec<HopCommand> {
    let write_and_forward = if direction.is_spine() {
        HopCommand::WriteAndForwardNs
    } else {
        HopCommand::WriteAndForwardEw
    };
    let mut commands = vec![forward(direction); start_distance - 1];
    commands.extend(std::iter::repeat_n(write_and_forward, range - 1));
    commands.push(forward(direction.opposite()));
    commands
}

fn forward(direction: Direction) -> HopCommand {
    match direction {
        Direction::East => HopCommand::ForwardEast,
        Direction::West => HopCommand::ForwardWest,
        Direction::North => HopCommand::ForwardNorth,
        Direction::South => HopCommand::ForwardSouth,
    }
}

/// Chips in a row, chip `i + 1` east of chip `i`.
#[derive(Clone, Debug)]
pub struct LineFabric {
    num_chips: usize,
    routing_mode: RoutingMode,
}

impl LineFabric {
    /// The longest line a line route can cross end to end.
    pub const MAX_CHIPS: usize = LineRouting::HOP_DISTANCE_MASK as usize + 1;

    pub fn new(num_chips: usize, routing_mode: RoutingMode) -> FabricResult<Self> {
        if !(2..=Self::MAX_CHIPS).contains(&num_chips) {
            fabric_error!(format!(
                "a line of {num_chips} chips, between 2 and {} supported",
                Self::MAX_CHIPS
            ));
        }
        if !is_line(routing_mode) {
            fabric_error!(format!("a line cannot use {routing_mode:?} routing"));
        }
        Ok(Self {
            num_chips,
            routing_mode,
        })
    }
}

impl fmt::Display for LineFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line of {} chips", self.num_chips)
    }
}

impl Topology for LineFabric {
    fn num_chips(&self) -> usize {
        self.num_chips
    }

    fn link_directions(&self) -> &[Direction] {
        &[Direction::East, Direction::West]
    }

    fn neighbour(&self, chip: usize, direction: Direction) -> Option<usize> {
        match direction {
            Direction::East => (chip + 1 < self.num_chips).then_some(chip + 1),
            Direction::West => chip.checked_sub(1).filter(|_| chip < self.num_chips),
            Direction::North | Direction::South => None,
        }
    }

    fn path(&self, src: usize, dst: usize) -> FabricResult<Vec<Direction>> {
        if src >= self.num_chips || dst >= self.num_chips {
            fabric_error!(format!("no route from chip {src} to {dst} in a {self}"));
        }
        Ok(if dst > src {
            vec![Direction::East; dst - src]
        } else {
            vec![Direction::West; src - dst]
        })
    }

    fn routing_mode(&self) -> RoutingMode {
        self.routing_mode
    }

    fn broadcast(&self, src: usize) -> FabricResult<Vec<Route>> {
        let east = self.num_chips - 1 - src;
        let mut routes = Vec::new();
        if east > 0 {
            routes.push(self.straight_line(src, Direction::East, 1, east)?);
        }
        if src > 0 {
            routes.push(self.straight_line(src, Direction::West, 1, src)?);
        }
        Ok(routes)
    }
}

/// A grid of chips, numbered row by row. Row 0 is the northern edge.
#[derive(Clone, Debug)]
pub struct MeshFabric {
    rows: usize,
    cols: usize,
}

impl MeshFabric {
    pub fn new(rows: usize, cols: usize) -> FabricResult<Self> {
        if rows * cols < 2 {
            fabric_error!(format!("a {rows}x{cols} mesh has no links"));
        }
        // Routes to the far corner have to fit the route buffer.
        if rows + cols > MeshRouting::MAX_HOPS {
            fabric_error!(format!("a {rows}x{cols} mesh is too large to route"));
        }
        Ok(Self { rows, cols })
    }

    #[must_use]
    pub fn position(&self, chip: usize) -> (usize, usize) {
        (chip / self.cols, chip % self.cols)
    }

    #[must_use]
    pub fn chip(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// Reach the rows north (or south) of `src`: a trunk along its column
    /// whose chips branch out east and west across their rows.
    fn rectangle(&self, src: usize, trunk: Direction) -> FabricResult<Option<Route>> {
        let (row, col) = self.position(src);
        let rows: Vec<usize> = match trunk {
            Direction::North => (0..row).rev().collect(),
            _ => (row + 1..self.rows).collect(),
        };
        let Some(last) = rows.len().checked_sub(1) else {
            return Ok(None);
        };
        let (east, west) = (self.cols - 1 - col, col);

        let through = match (east > 0, west > 0) {
            (true, true) => HopCommand::WriteAndForwardNsew,
            (true, false) => HopCommand::WriteAndForwardNse,
            (false, true) => HopCommand::WriteAndForwardNsw,
            (false, false) => HopCommand::WriteAndForwardNs,
        };
        // The final trunk hop is named after the link it arrived on.
        let end = match (trunk, east > 0, west > 0) {
            (_, false, false) => forward(trunk.opposite()),
            (Direction::North, true, true) => HopCommand::WriteAndForwardSew,
            (Direction::North, true, false) => HopCommand::WriteAndForwardSe,
            (Direction::North, false, true) => HopCommand::WriteAndForwardSw,
            (_, true, true) => HopCommand::WriteAndForwardNew,
            (_, true, false) => HopCommand::WriteAndForwardNe,
            (_, false, true) => HopCommand::WriteAndForwardNw,
        };
        let mut trunk_commands = vec![through; last];
        trunk_commands.push(end);
        let branch = |length: usize, direction: Direction| {
            if length == 0 {
                Vec::new()
            } else {
                straight_line_commands(direction, 1, length)
            }
        };
        let routing = MeshRouting::multicast(
            &trunk_commands,
            &branch(east, Direction::East),
            &branch(west, Direction::West),
        )?;

        let destinations = rows
            .iter()
            .flat_map(|r| (0..self.cols).map(move |c| (*r, c)))
            .map(|(r, c)| self.chip(r, c))
            .collect();
        Ok(Some(Route {
            direction: trunk,
            routing: RoutingFields::Mesh(routing),
            destinations,
        }))
    }
}

impl fmt::Display for MeshFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} mesh", self.rows, self.cols)
    }
}

impl Topology for MeshFabric {
    fn num_chips(&self) -> usize {
        self.rows * self.cols
    }

    fn link_directions(&self) -> &[Direction] {
        &Direction::ALL
    }

    fn neighbour(&self, chip: usize, direction: Direction) -> Option<usize> {
        if chip >= self.num_chips() {
            return None;
        }
        let (row, col) = self.position(chip);
        let (row, col) = match direction {
            Direction::East => (row, col + 1),
            Direction::West => (row, col.checked_sub(1)?),
            Direction::North => (row.checked_sub(1)?, col),
            Direction::South => (row + 1, col),
        };
        (row < self.rows && col < self.cols).then(|| self.chip(row, col))
    }

    /// East/west first, then north/south, so no route ever turns off the
    /// north/south links.
    fn path(&self, src: usize, dst: usize) -> FabricResult<Vec<Direction>> {
        if src >= self.num_chips() || dst >= self.num_chips() {
            fabric_error!(format!("no route from chip {src} to {dst} in a {self}"));
        }
        let (src_row, src_col) = self.position(src);
        let (dst_row, dst_col) = self.position(dst);
        let mut path = Vec::new();
        if dst_col > src_col {
            path.extend(std::iter::repeat_n(Direction::East, dst_col - src_col));
        } else {
            path.extend(std::iter::repeat_n(Direction::West, src_col - dst_col));
        }
        if dst_row > src_row {
            path.extend(std::iter::repeat_n(Direction::South, dst_row - src_row));
        } else {
            path.extend(std::iter::repeat_n(Direction::North, src_row - dst_row));
        }
        Ok(path)
    }

    fn routing_mode(&self) -> RoutingMode {
        RoutingMode::Mesh
    }

    fn broadcast(&self, src: usize) -> FabricResult<Vec<Route>> {
        let (_, col) = self.position(src);
        let mut routes = Vec::new();
        let east = self.cols - 1 - col;
        if east > 0 {
            routes.push(self.straight_line(src, Direction::East, 1, east)?);
        }
        if col > 0 {
            routes.push(self.straight_line(src, Direction::West, 1, col)?);
        }
        for trunk in [Direction::North, Direction::South] {
            routes.extend(self.rectangle(src, trunk)?);
        }
        Ok(routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_neighbours_stop_at_the_ends() {
        let line = LineFabric::new(3, RoutingMode::Line).unwrap();
        assert_eq!(line.neighbour(0, Direction::East), Some(1));
        assert_eq!(line.neighbour(0, Direction::West), None);
        assert_eq!(line.neighbour(2, Direction::East), None);
        assert_eq!(line.neighbour(1, Direction::North), None);
        assert_eq!(line.present_directions(1), vec![Direction::East, Direction::West]);
        assert_eq!(line.present_directions(2), vec![Direction::West]);
    }

    #[test]
    fn line_unicast_counts_hops() {
        let line = LineFabric::new(5, RoutingMode::Line).unwrap();
        let route = line.unicast(4, 1).unwrap();
        assert_eq!(route.direction, Direction::West);
        assert_eq!(route.routing, RoutingFields::Line(LineRouting::unicast(3).unwrap()));
        assert_eq!(route.destinations, vec![1]);
        assert!(line.unicast(2, 2).is_err());
    }

    #[test]
    fn line_multicast_lists_destinations() {
        let line = LineFabric::new(6, RoutingMode::LowLatencyLine).unwrap();
        let route = line.straight_line(1, Direction::East, 2, 3).unwrap();
        assert_eq!(route.destinations, vec![3, 4, 5]);
        assert_eq!(
            route.routing,
            RoutingFields::LowLatencyLine(LowLatencyLineRouting::multicast(2, 3).unwrap())
        );
        assert!(line.straight_line(1, Direction::East, 2, 4).is_err());
    }

    #[test]
    fn line_broadcast_goes_both_ways() {
        let line = LineFabric::new(4, RoutingMode::Line).unwrap();
        let routes = line.broadcast(1).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destinations, vec![2, 3]);
        assert_eq!(routes[1].destinations, vec![0]);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(LineFabric::new(1, RoutingMode::Line).is_err());
        assert!(LineFabric::new(17, RoutingMode::Line).is_err());
        assert!(LineFabric::new(4, RoutingMode::Mesh).is_err());
        assert!(MeshFabric::new(1, 1).is_err());
    }

    #[test]
    fn config_must_match_routing() {
        let line = LineFabric::new(4, RoutingMode::Line).unwrap();
        let mesh = MeshFabric::new(2, 2).unwrap();
        let config = RouterConfig::default();
        line.check_config(&config).unwrap();
        assert!(mesh.check_config(&config).is_err());
        let low_latency = RouterConfig {
            routing_mode: RoutingMode::LowLatencyLine,
            ..RouterConfig::default()
        };
        line.check_config(&low_latency).unwrap();
    }

    #[test]
    fn mesh_paths_go_east_west_first() {
        let mesh = MeshFabric::new(3, 3).unwrap();
        assert_eq!(
            mesh.path(mesh.chip(2, 0), mesh.chip(0, 2)).unwrap(),
            vec![Direction::East, Direction::East, Direction::North, Direction::North]
        );
        assert_eq!(mesh.neighbour(mesh.chip(0, 1), Direction::North), None);
        assert_eq!(mesh.neighbour(mesh.chip(1, 1), Direction::South), Some(mesh.chip(2, 1)));
    }

    #[test]
    fn mesh_unicast_ends_writing_locally() {
        let mesh = MeshFabric::new(2, 2).unwrap();
        let route = mesh.unicast(0, 3).unwrap();
        assert_eq!(route.direction, Direction::East);
        let RoutingFields::Mesh(routing) = route.routing else {
            panic!("mesh route expected");
        };
        assert_eq!(routing.command().unwrap(), HopCommand::ForwardSouth);
        let next = routing.next_hop(Direction::South, false);
        assert_eq!(next.command().unwrap(), HopCommand::ForwardNorth);
        let targets = next.command().unwrap().targets(Direction::North);
        assert!(targets.local);
        assert!(targets.forward.is_empty());
    }

    #[test]
    fn mesh_straight_line_writes_along_the_way() {
        let mesh = MeshFabric::new(1, 4).unwrap();
        let route = mesh.straight_line(0, Direction::East, 1, 3).unwrap();
        assert_eq!(route.destinations, vec![1, 2, 3]);
        let RoutingFields::Mesh(routing) = route.routing else {
            panic!("mesh route expected");
        };
        let first = routing.command().unwrap().targets(Direction::West);
        assert!(first.local);
        assert!(first.forward.contains(Direction::East));
    }

    #[test]
    fn mesh_broadcast_covers_every_other_chip() {
        let mesh = MeshFabric::new(3, 3).unwrap();
        for src in 0..mesh.num_chips() {
            let mut reached: Vec<usize> = mesh
                .broadcast(src)
                .unwrap()
                .into_iter()
                .flat_map(|route| route.destinations)
                .collect();
            reached.sort_unstable();
            let expected: Vec<usize> = (0..9).filter(|c| *c != src).collect();
            assert_eq!(reached, expected, "broadcast from {src}");
        }
    }

    #[test]
    fn mesh_rectangle_branches_from_the_trunk() {
        let mesh = MeshFabric::new(3, 3).unwrap();
        let route = mesh
            .rectangle(mesh.chip(2, 1), Direction::North)
            .unwrap()
            .unwrap();
        let RoutingFields::Mesh(routing) = route.routing else {
            panic!("mesh route expected");
        };
        assert_eq!(routing.command().unwrap(), HopCommand::WriteAndForwardNsew);
        let last_row = routing.next_hop(Direction::North, false);
        let targets = last_row.command().unwrap().targets(Direction::South);
        assert!(targets.local);
        assert!(!targets.forward.contains(Direction::North));
        assert!(targets.forward.contains(Direction::East));

        let branch = routing.next_hop(Direction::East, true);
        assert_eq!(branch.command().unwrap(), HopCommand::ForwardWest);
        assert!(branch.command().unwrap().targets(Direction::West).local);
    }
}
