// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Id

/// Ids that are unique across a fabric.
///
/// Each entity is given a unique id when it is created. There are two
/// reserved values: [NO_ID](crate::NO_ID) and [ROOT](crate::ROOT).
#[derive(Copy, Clone, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Id(pub u64);

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
