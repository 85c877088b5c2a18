// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Shared types: errors, addresses and identifiers.

use std::fmt;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

/// The error type used across the fabric.
///
/// Errors only arise while building routers and when decoding values read
/// from memory. The per-channel steps never fail: a step that cannot make
/// progress is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricError(pub String);

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.0)
    }
}

impl std::error::Error for FabricError {}

impl From<figment::Error> for FabricError {
    fn from(e: figment::Error) -> Self {
        FabricError(format!("config: {e}"))
    }
}

impl From<std::io::Error> for FabricError {
    fn from(e: std::io::Error) -> Self {
        FabricError(format!("io: {e}"))
    }
}

impl From<edm_track::TrackConfigError> for FabricError {
    fn from(e: edm_track::TrackConfigError) -> Self {
        FabricError(e.to_string())
    }
}

pub type FabricResult<T = ()> = Result<T, FabricError>;

/// Return early with a [`FabricError`] built from a message.
#[macro_export]
macro_rules! fabric_error {
    ($msg:expr) => {
        return Err($crate::types::FabricError($msg.to_string()))
    };
}

/// Byte address within the L1 memory of a core.
pub type L1Addr = u32;

/// Coordinates of a core on the network on chip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoreCoord {
    pub x: u8,
    pub y: u8,
}

impl CoreCoord {
    #[must_use]
    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// An L1 address on a given core, as targeted by NoC writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NocAddr {
    pub core: CoreCoord,
    pub addr: L1Addr,
}

impl NocAddr {
    #[must_use]
    pub const fn new(core: CoreCoord, addr: L1Addr) -> Self {
        Self { core, addr }
    }

    #[must_use]
    pub const fn offset(self, bytes: u32) -> Self {
        Self {
            core: self.core,
            addr: self.addr + bytes,
        }
    }
}

impl fmt::Display for NocAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.core, self.addr)
    }
}

/// Identifies one hardware stream (counter) register of a core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u8);

/// Identifies one of the Ethernet transmit queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxqId(pub u8);

/// A hardware write-completion tracking handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u8);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trid{}", self.0)
    }
}

/// The router status register value, pollable by the host.
///
/// The values follow the startup sequence in order, a router whose status
/// stops advancing has failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u32)]
pub enum EdmStatus {
    Started = 0xa0b0_c0d0,
    RemoteHandshakeComplete = 0xa1b1_c1d1,
    LocalHandshakeComplete = 0xa2b2_c2d2,
    ReadyForTraffic = 0xa3b3_c3d3,
    Terminated = 0xa4b4_c4d4,
}

/// Value of the termination signal register, written by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum TerminationSignal {
    #[default]
    KeepRunning = 0,
    /// Leave the main loop once every serviced channel is drained.
    GracefullyTerminate = 1,
    /// Leave the main loop at the end of the current batch.
    ImmediatelyTerminate = 2,
}
