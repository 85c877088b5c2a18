// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Free-running credit counters.
//!
//! Every credit counter in the fabric is a free-running unsigned integer that
//! is only ever compared with another counter by difference. The difference
//! is computed with wrapping arithmetic so that a counter that has wrapped
//! past the end of its range still compares correctly against one that has
//! not, as long as the two are never more than half the range apart.
//!
//! The width of the counter is a type parameter so that tests can use `u8` to
//! force wraparound after a few hundred packets.

use std::fmt;

use num_traits::{WrappingAdd, WrappingSub};

/// An unsigned integer type usable as a free-running counter.
pub trait CounterWord:
    Copy + Default + Eq + fmt::Debug + fmt::Display + WrappingAdd + WrappingSub + Send + 'static
{
    const ONE: Self;

    /// Truncate a hardware register value to this width.
    fn from_register(value: i32) -> Self;

    /// Truncate a count to this width.
    fn from_count(count: usize) -> Self;

    fn as_count(self) -> usize;
}

macro_rules! impl_counter_word {
    ($($t:ty),*) => {
        $(
            impl CounterWord for $t {
                const ONE: Self = 1;

                fn from_register(value: i32) -> Self {
                    value as $t
                }

                fn from_count(count: usize) -> Self {
                    count as $t
                }

                fn as_count(self) -> usize {
                    self as usize
                }
            }
        )*
    };
}

impl_counter_word!(u8, u16, u32);

/// A counter that only moves forward and wraps at the width of `W`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeRunningCounter<W: CounterWord>(W);

impl<W: CounterWord> FreeRunningCounter<W> {
    #[must_use]
    pub fn new() -> Self {
        Self(W::default())
    }

    #[must_use]
    pub fn from_raw(value: W) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn value(&self) -> W {
        self.0
    }

    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(&W::ONE);
    }

    pub fn increment_by(&mut self, n: usize) {
        self.0 = self.0.wrapping_add(&W::from_count(n));
    }

    /// How far `self` is ahead of `behind`.
    #[must_use]
    pub fn distance_from(&self, behind: &Self) -> usize {
        self.0.wrapping_sub(&behind.0).as_count()
    }

    /// How far a raw (e.g. register) value is ahead of `self`.
    #[must_use]
    pub fn behind_by(&self, ahead: W) -> usize {
        ahead.wrapping_sub(&self.0).as_count()
    }
}

impl<W: CounterWord> fmt::Debug for FreeRunningCounter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a slot in a channel buffer, wrapping at the number of slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferIndex(pub u8);

impl BufferIndex {
    #[must_use]
    pub fn next(self, num_buffers: usize) -> Self {
        let next = self.0 as usize + 1;
        if next == num_buffers {
            BufferIndex(0)
        } else {
            BufferIndex(next as u8)
        }
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A free-running counter paired with the buffer slot it points at.
///
/// The slot index is kept separately because the counter width is not in
/// general a multiple of the number of buffers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelCounter<W: CounterWord> {
    counter: FreeRunningCounter<W>,
    index: BufferIndex,
    num_buffers: usize,
}

impl<W: CounterWord> ChannelCounter<W> {
    #[must_use]
    pub fn new(num_buffers: usize) -> Self {
        Self {
            counter: FreeRunningCounter::new(),
            index: BufferIndex(0),
            num_buffers,
        }
    }

    pub fn increment(&mut self) {
        self.counter.increment();
        self.index = self.index.next(self.num_buffers);
    }

    pub fn increment_by(&mut self, n: usize) {
        for _ in 0..n {
            self.increment();
        }
    }

    #[must_use]
    pub fn counter(&self) -> FreeRunningCounter<W> {
        self.counter
    }

    #[must_use]
    pub fn buffer_index(&self) -> BufferIndex {
        self.index
    }

    #[must_use]
    pub fn is_caught_up_to(&self, leader: &Self) -> bool {
        self.counter == leader.counter
    }

    #[must_use]
    pub fn distance_from(&self, behind: &Self) -> usize {
        self.counter.distance_from(&behind.counter)
    }
}

impl<W: CounterWord> fmt::Debug for ChannelCounter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.counter, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_survives_wraparound() {
        let mut behind = FreeRunningCounter::<u8>::from_raw(250);
        let mut ahead = behind;
        ahead.increment_by(10);
        assert_eq!(ahead.value(), 4);
        assert_eq!(ahead.distance_from(&behind), 10);

        behind.increment_by(7);
        assert_eq!(ahead.distance_from(&behind), 3);
    }

    #[test]
    fn register_truncation() {
        let counter = FreeRunningCounter::<u8>::from_raw(255);
        assert_eq!(counter.behind_by(u8::from_register(257)), 2);
        assert_eq!(u16::from_register(-1), u16::MAX);
    }

    #[test]
    fn buffer_index_wraps_at_num_buffers() {
        let mut counter = ChannelCounter::<u8>::new(3);
        let indices: Vec<usize> = (0..7)
            .map(|_| {
                let index = counter.buffer_index().get();
                counter.increment();
                index
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn index_independent_of_counter_width() {
        // 256 is not a multiple of 3 so the slot cannot be derived from the
        // counter value after it wraps.
        let mut counter = ChannelCounter::<u8>::new(3);
        counter.increment_by(256);
        assert_eq!(counter.counter().value(), 0);
        assert_eq!(counter.buffer_index().get(), 256 % 3);
    }

    #[test]
    fn caught_up() {
        let mut leader = ChannelCounter::<u16>::new(4);
        let mut follower = ChannelCounter::<u16>::new(4);
        assert!(follower.is_caught_up_to(&leader));
        leader.increment();
        assert!(!follower.is_caught_up_to(&leader));
        assert_eq!(leader.distance_from(&follower), 1);
        follower.increment();
        assert!(follower.is_caught_up_to(&leader));
    }
}
