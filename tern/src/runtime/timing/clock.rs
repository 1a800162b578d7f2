//! Nanosecond clocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use minstant::Instant;

use super::time::{NanoDuration, NanoTime};

/// Monotonic nanosecond clock shared by the conductor and its agents.
pub trait NanoClock: Send + Sync {
    fn now(&self) -> NanoTime;
}

/// TSC-backed monotonic clock measured from its construction.
#[derive(Clone, Copy)]
pub struct SystemNanoClock {
    epoch: Instant,
}

impl SystemNanoClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemNanoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NanoClock for SystemNanoClock {
    fn now(&self) -> NanoTime {
        NanoTime::new(u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: NanoTime) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(start.as_u64())),
        }
    }

    pub fn set(&self, now: NanoTime) {
        self.nanos.store(now.as_u64(), Ordering::Release);
    }

    pub fn advance(&self, by: NanoDuration) {
        self.nanos.fetch_add(by.as_u64(), Ordering::AcqRel);
    }
}

impl NanoClock for ManualClock {
    fn now(&self) -> NanoTime {
        NanoTime::new(self.nanos.load(Ordering::Acquire))
    }
}

impl<C: NanoClock + ?Sized> NanoClock for Arc<C> {
    fn now(&self) -> NanoTime {
        (**self).now()
    }
}
