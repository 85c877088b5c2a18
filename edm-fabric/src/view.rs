// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Typed views over fixed L1 addresses.
//!
//! Every structured value the router keeps in L1 (semaphores, the status and
//! termination registers, packet headers) is accessed through a
//! [`TypedView`]. The view is the only place where bytes are converted to and
//! from typed values, all conversions are little-endian.

use std::marker::PhantomData;

use num_traits::FromPrimitive;

use crate::hal::LocalMemory;
use crate::types::{EdmStatus, FabricError, FabricResult, L1Addr, TerminationSignal};

/// Largest value that can be held in L1 through a view.
pub const MAX_VIEW_BYTES: usize = 64;

/// A value with a fixed L1 encoding.
pub trait L1Value: Sized {
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> FabricResult<Self>;

    fn encode(&self, bytes: &mut [u8]);
}

/// A typed view of the value at a fixed L1 address.
pub struct TypedView<T> {
    addr: L1Addr,
    _value: PhantomData<T>,
}

impl<T> Clone for TypedView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedView<T> {}

impl<T> std::fmt::Debug for TypedView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypedView({:#x})", self.addr)
    }
}

impl<T: L1Value> TypedView<T> {
    #[must_use]
    pub const fn at(addr: L1Addr) -> Self {
        const { assert!(T::SIZE <= MAX_VIEW_BYTES) };
        Self {
            addr,
            _value: PhantomData,
        }
    }

    #[must_use]
    pub const fn addr(&self) -> L1Addr {
        self.addr
    }

    pub fn read<M: LocalMemory + ?Sized>(&self, memory: &M) -> FabricResult<T> {
        let mut buf = [0u8; MAX_VIEW_BYTES];
        memory.read_l1(self.addr, &mut buf[..T::SIZE]);
        T::decode(&buf[..T::SIZE])
    }

    pub fn write<M: LocalMemory + ?Sized>(&self, memory: &M, value: &T) {
        let mut buf = [0u8; MAX_VIEW_BYTES];
        value.encode(&mut buf[..T::SIZE]);
        memory.write_l1(self.addr, &buf[..T::SIZE]);
    }
}

impl TypedView<u32> {
    /// Read a word, words always decode.
    pub fn load<M: LocalMemory + ?Sized>(&self, memory: &M) -> u32 {
        let mut buf = [0u8; 4];
        memory.read_l1(self.addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn store<M: LocalMemory + ?Sized>(&self, memory: &M, value: u32) {
        memory.write_l1(self.addr, &value.to_le_bytes());
    }
}

impl L1Value for u32 {
    const SIZE: usize = 4;

    fn decode(bytes: &[u8]) -> FabricResult<Self> {
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[..4].copy_from_slice(&self.to_le_bytes());
    }
}

impl L1Value for u16 {
    const SIZE: usize = 2;

    fn decode(bytes: &[u8]) -> FabricResult<Self> {
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[..2].copy_from_slice(&self.to_le_bytes());
    }
}

impl L1Value for u8 {
    const SIZE: usize = 1;

    fn decode(bytes: &[u8]) -> FabricResult<Self> {
        Ok(bytes[0])
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[0] = *self;
    }
}

impl L1Value for EdmStatus {
    const SIZE: usize = 4;

    fn decode(bytes: &[u8]) -> FabricResult<Self> {
        let raw = u32::decode(bytes)?;
        EdmStatus::from_u32(raw).ok_or_else(|| FabricError(format!("unknown status {raw:#x}")))
    }

    fn encode(&self, bytes: &mut [u8]) {
        (*self as u32).encode(bytes);
    }
}

impl L1Value for TerminationSignal {
    const SIZE: usize = 4;

    fn decode(bytes: &[u8]) -> FabricResult<Self> {
        let raw = u32::decode(bytes)?;
        TerminationSignal::from_u32(raw)
            .ok_or_else(|| FabricError(format!("unknown termination signal {raw}")))
    }

    fn encode(&self, bytes: &mut [u8]) {
        (*self as u32).encode(bytes);
    }
}
