// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Traffic patterns: which chips send to which.

use std::fmt;

use edm_fabric::types::FabricResult;
use itertools::iproduct;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::topology::{Route, Topology};
use crate::worker::Flow;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficPattern {
    /// Every chip sends to the chip at the other end of each of its links.
    #[default]
    Neighbour,
    /// Every chip sends to every other chip.
    AllToAll,
    /// `flows` unicasts between chips picked at random.
    Random { flows: usize, seed: u64 },
    /// Every chip multicasts to every other chip.
    Broadcast,
}

impl fmt::Display for TrafficPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficPattern::Neighbour => write!(f, "neighbour"),
            TrafficPattern::AllToAll => write!(f, "all-to-all"),
            TrafficPattern::Random { flows, seed } => write!(f, "{flows} random (seed {seed})"),
            TrafficPattern::Broadcast => write!(f, "broadcast"),
        }
    }
}

impl TrafficPattern {
    /// The flows of the pattern over `topology`, numbered from 0.
    pub fn flows(
        &self,
        topology: &dyn Topology,
        num_packets: usize,
        payload_bytes: usize,
    ) -> FabricResult<Vec<Flow>> {
        let num_chips = topology.num_chips();
        let routes: Vec<(usize, Route)> = match self {
            TrafficPattern::Neighbour => {
                let mut routes = Vec::new();
                for src in 0..num_chips {
                    for direction in topology.present_directions(src) {
                        if let Some(dst) = topology.neighbour(src, direction) {
                            routes.push((src, topology.unicast(src, dst)?));
                        }
                    }
                }
                routes
            }
            TrafficPattern::AllToAll => iproduct!(0..num_chips, 0..num_chips)
                .filter(|(src, dst)| src != dst)
                .map(|(src, dst)| topology.unicast(src, dst).map(|route| (src, route)))
                .collect::<FabricResult<_>>()?,
            TrafficPattern::Random { flows, seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                let mut routes = Vec::with_capacity(*flows);
                while routes.len() < *flows && num_chips > 1 {
                    let src = rng.gen_range(0..num_chips);
                    let dst = rng.gen_range(0..num_chips);
                    if src != dst {
                        routes.push((src, topology.unicast(src, dst)?));
                    }
                }
                routes
            }
            TrafficPattern::Broadcast => {
                let mut routes = Vec::new();
                for src in 0..num_chips {
                    routes.extend(topology.broadcast(src)?.into_iter().map(|route| (src, route)));
                }
                routes
            }
        };

        Ok(routes
            .into_iter()
            .enumerate()
            .map(|(id, (src, route))| Flow {
                id,
                src,
                route,
                num_packets,
                payload_bytes,
            })
            .collect())
    }
}
