// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Per-core storage: the L1 memory and the stream register file.
//!
//! Both are shared between the threads of a simulation. Every L1 access
//! takes the memory's lock for its whole length, so a reader never sees half
//! of a write, and stream registers are sequentially consistent atomics.
//! A router that increments a counter after writing a slot is therefore
//! guaranteed that whoever sees the counter also sees the slot.

use std::ops::Range;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use edm_fabric::fabric_error;
use edm_fabric::hal::{LocalMemory, StreamRegisters};
use edm_fabric::layout::streams::NUM_STREAM_REGISTERS;
use edm_fabric::types::{FabricError, FabricResult, L1Addr, StreamId};

pub const NUM_SCRATCH_REGISTERS: usize = 8;

/// Byte addressed memory of a core.
pub struct L1Memory {
    bytes: Mutex<Vec<u8>>,
}

impl L1Memory {
    #[must_use]
    pub fn new(size_bytes: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size_bytes]),
        }
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn range(size: usize, addr: L1Addr, length: usize) -> FabricResult<Range<usize>> {
        let start = addr as usize;
        match start.checked_add(length) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(FabricError(format!(
                "access of {length} bytes at {addr:#x} outside {size} bytes of L1"
            ))),
        }
    }

    pub fn read(&self, addr: L1Addr, buf: &mut [u8]) -> FabricResult {
        let bytes = self.lock();
        let range = Self::range(bytes.len(), addr, buf.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    pub fn write(&self, addr: L1Addr, data: &[u8]) -> FabricResult {
        let mut bytes = self.lock();
        let range = Self::range(bytes.len(), addr, data.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Add `increment` to the little endian word at `addr`, returning the
    /// previous value.
    pub fn atomic_inc(&self, addr: L1Addr, increment: u32) -> FabricResult<u32> {
        if addr % 4 != 0 {
            fabric_error!(format!("atomic increment of unaligned address {addr:#x}"));
        }
        let mut bytes = self.lock();
        let range = Self::range(bytes.len(), addr, 4)?;
        let mut word = [0; 4];
        word.copy_from_slice(&bytes[range.clone()]);
        let old = u32::from_le_bytes(word);
        bytes[range].copy_from_slice(&old.wrapping_add(increment).to_le_bytes());
        Ok(old)
    }

    /// Copy `length` bytes out of this memory, ready to be written elsewhere.
    pub fn read_vec(&self, addr: L1Addr, length: usize) -> FabricResult<Vec<u8>> {
        let mut buf = vec![0; length];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }
}

/// Host access to the memory. The host only touches the fixed words of the
/// router memory map, so a failed access is logged rather than returned.
impl LocalMemory for L1Memory {
    fn read_l1(&self, addr: L1Addr, buf: &mut [u8]) {
        if let Err(e) = self.read(addr, buf) {
            log::error!("host read: {e}");
        }
    }

    fn write_l1(&self, addr: L1Addr, data: &[u8]) {
        if let Err(e) = self.write(addr, data) {
            log::error!("host write: {e}");
        }
    }

    fn invalidate_local_view(&self) {}
}

/// The stream (counter) registers and scratch registers of a core, shared by
/// the cores of a two-core router.
pub struct StreamRegisterFile {
    counters: [AtomicI32; NUM_STREAM_REGISTERS],
    scratch: [AtomicU32; NUM_SCRATCH_REGISTERS],
}

impl Default for StreamRegisterFile {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI32::new(0)),
            scratch: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

impl StreamRegisterFile {
    fn counter(&self, id: StreamId) -> Option<&AtomicI32> {
        let counter = self.counters.get(id.0 as usize);
        if counter.is_none() {
            log::error!("no stream register {}", id.0);
        }
        counter
    }
}

impl StreamRegisters for StreamRegisterFile {
    fn read_counter(&self, id: StreamId) -> i32 {
        self.counter(id)
            .map_or(0, |counter| counter.load(Ordering::SeqCst))
    }

    fn increment_local(&self, id: StreamId, delta: i32) {
        if let Some(counter) = self.counter(id) {
            counter.fetch_add(delta, Ordering::SeqCst);
        }
    }

    fn init_counter(&self, id: StreamId, value: i32) {
        if let Some(counter) = self.counter(id) {
            counter.store(value, Ordering::SeqCst);
        }
    }

    fn read_scratch(&self, index: usize) -> u32 {
        self.scratch
            .get(index)
            .map_or(0, |scratch| scratch.load(Ordering::SeqCst))
    }

    fn write_scratch(&self, index: usize, value: u32) {
        if let Some(scratch) = self.scratch.get(index) {
            scratch.store(value, Ordering::SeqCst);
        }
    }
}
