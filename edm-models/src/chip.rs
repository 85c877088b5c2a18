// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Simulated chips and the cores on them.
//!
//! Every chip uses the same placement: the router of each direction sits on
//! row 0 at the column of its direction index, the worker injecting into that
//! router sits below it on row 1 and the chip's sink worker, which receives
//! all traffic addressed to the chip, sits on row 2.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use edm_fabric::direction::Direction;
use edm_fabric::types::CoreCoord;

use crate::memory::{L1Memory, StreamRegisterFile};

#[must_use]
pub const fn edm_core(direction: Direction) -> CoreCoord {
    CoreCoord::new(direction.index() as u8, 0)
}

#[must_use]
pub const fn injector_core(direction: Direction) -> CoreCoord {
    CoreCoord::new(direction.index() as u8, 1)
}

pub const SINK_CORE: CoreCoord = CoreCoord::new(0, 2);

pub struct SimCore {
    pub coord: CoreCoord,
    pub l1: L1Memory,
    pub streams: StreamRegisterFile,
}

impl SimCore {
    #[must_use]
    pub fn new(coord: CoreCoord, l1_bytes: usize) -> Self {
        Self {
            coord,
            l1: L1Memory::new(l1_bytes),
            streams: StreamRegisterFile::default(),
        }
    }
}

impl fmt::Debug for SimCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimCore{}", self.coord)
    }
}

/// The cores of one chip, reachable from each other over the NoC.
#[derive(Debug)]
pub struct Chip {
    pub index: usize,
    cores: BTreeMap<CoreCoord, Arc<SimCore>>,
}

impl Chip {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            cores: BTreeMap::new(),
        }
    }

    /// Add a core, replacing any core already at `coord`.
    pub fn add_core(&mut self, coord: CoreCoord, l1_bytes: usize) -> Arc<SimCore> {
        let core = Arc::new(SimCore::new(coord, l1_bytes));
        self.cores.insert(coord, core.clone());
        core
    }

    #[must_use]
    pub fn core(&self, coord: CoreCoord) -> Option<&Arc<SimCore>> {
        self.cores.get(&coord)
    }

    pub fn cores(&self) -> impl Iterator<Item = &Arc<SimCore>> {
        self.cores.values()
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chip{}", self.index)
    }
}
