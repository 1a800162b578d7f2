//! Timing primitives: typed time, clocks and the hashed timer wheel.
//!
//! Everything here is per-thread and shared-nothing except the clocks.

mod clock;
mod slab;
mod tick;
mod time;
mod wheel;

pub use clock::{ManualClock, NanoClock, SystemNanoClock};
pub use time::{Duration, Millis, NanoDuration, NanoTime, Nanos, TimeUnit, Timestamp};
pub use wheel::{PowerOfTwo, TimerHandle, Wheel, WheelConfig, WheelError};
