//! Strongly-typed timestamps and durations.
//!
//! Every deadline in the driver is an absolute [`Timestamp`] compared against
//! one clock sample taken per duty cycle.
use core::marker::PhantomData;

/// Marker trait for a time unit.
pub trait TimeUnit {
    /// Short name for logs.
    const NAME: &'static str;
    /// Nanoseconds per unit.
    const NANOS: u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Nanos {}
impl TimeUnit for Nanos {
    const NAME: &'static str = "ns";
    const NANOS: u64 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Millis {}
impl TimeUnit for Millis {
    const NAME: &'static str = "ms";
    const NANOS: u64 = 1_000_000;
}

/// Span of time in unit `U`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Duration<U: TimeUnit>(u64, PhantomData<U>);

/// Point in time in unit `U`, relative to the clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp<U: TimeUnit>(u64, PhantomData<U>);

impl<U: TimeUnit> Duration<U> {
    pub const ZERO: Self = Self::new(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Duration<Nanos> {
    /// Converts from `std::time::Duration`, saturating at `u64::MAX` nanoseconds.
    #[must_use]
    pub fn from_std(d: std::time::Duration) -> Self {
        Self::new(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self::new(ms * Millis::NANOS)
    }

    #[must_use]
    pub const fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0)
    }
}

impl<U: TimeUnit> Timestamp<U> {
    pub const ZERO: Self = Self::new(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    #[inline]
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> Duration<U> {
        Duration::new(self.0.saturating_sub(earlier.0))
    }
}

impl<U: TimeUnit> core::ops::Add<Duration<U>> for Timestamp<U> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Duration<U>) -> Self::Output {
        Self::new(self.0.saturating_add(rhs.0))
    }
}

impl<U: TimeUnit> core::ops::Sub<Duration<U>> for Timestamp<U> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Duration<U>) -> Self::Output {
        Self::new(self.0.saturating_sub(rhs.0))
    }
}

impl<U: TimeUnit> core::fmt::Display for Timestamp<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.0, U::NAME)
    }
}

impl<U: TimeUnit> core::fmt::Display for Duration<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.0, U::NAME)
    }
}

/// Nanosecond timestamp used throughout the driver.
pub type NanoTime = Timestamp<Nanos>;
/// Nanosecond span used throughout the driver.
pub type NanoDuration = Duration<Nanos>;
