// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Link directions and small sets of them.
//!
//! A router is identified by the direction its link leaves the chip in. A
//! packet received by the `West` router came in over the west link.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const NUM_DIRECTIONS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    East = 0,
    West = 1,
    North = 2,
    South = 3,
}

impl Direction {
    pub const ALL: [Direction; NUM_DIRECTIONS] = [
        Direction::East,
        Direction::West,
        Direction::North,
        Direction::South,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Direction::East => Direction::West,
            Direction::West => Direction::East,
            Direction::North => Direction::South,
            Direction::South => Direction::North,
        }
    }

    /// North and south links form the trunk of a 2-D multicast.
    #[must_use]
    pub const fn is_spine(self) -> bool {
        (self as u8) & 0b10 != 0
    }

    /// Position of `self` among the directions other than `excluding`.
    ///
    /// Routers only keep downstream state for the three directions that are
    /// not their own, this gives the index into that compact array.
    #[must_use]
    pub const fn compact_index(self, excluding: Direction) -> Option<usize> {
        let me = self as usize;
        let ex = excluding as usize;
        if me == ex {
            None
        } else if me > ex {
            Some(me - 1)
        } else {
            Some(me)
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::East => "east",
            Direction::West => "west",
            Direction::North => "north",
            Direction::South => "south",
        };
        write!(f, "{name}")
    }
}

/// A set of directions stored as a bitmask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DirectionSet(u8);

impl DirectionSet {
    pub const EMPTY: DirectionSet = DirectionSet(0);

    #[must_use]
    pub const fn of(directions: &[Direction]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < directions.len() {
            bits |= 1 << directions[i] as u8;
            i += 1;
        }
        Self(bits)
    }

    pub fn insert(&mut self, direction: Direction) {
        self.0 |= 1 << direction as u8;
    }

    pub fn remove(&mut self, direction: Direction) {
        self.0 &= !(1 << direction as u8);
    }

    #[must_use]
    pub const fn contains(self, direction: Direction) -> bool {
        self.0 & (1 << direction as u8) != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = Direction> {
        Direction::ALL
            .into_iter()
            .filter(move |d| self.contains(*d))
    }
}

impl fmt::Debug for DirectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
