//! Tick-space coordinates for the timing wheel.
//!
//! `tick = floor(nanos / tick_length)`. Keeping ticks in their own types stops
//! them being mixed up with nanosecond timestamps.

use core::ops::Add;

/// A point on the tick lattice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TickInstant(u64);

impl TickInstant {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Ticks from `earlier` to `self`, zero if `earlier` is later.
    #[inline]
    #[must_use]
    pub const fn span_since(self, earlier: Self) -> TickSpan {
        TickSpan(self.0.saturating_sub(earlier.0))
    }
}

/// A number of ticks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TickSpan(u64);

impl TickSpan {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Add<TickSpan> for TickInstant {
    type Output = Self;

    #[inline]
    fn add(self, rhs: TickSpan) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}
