//! Runtime scaffolding for the driver.
//!
//! - `timing`: typed time, clocks and the hashed timer wheel.
//! - `agent`: the duty-cycle `Agent` trait, idle strategies and the thread runner.
//! - `topology`: CPU detection and agent thread placement.
//! - `driver`: the conductor, its entities and the `MediaDriver` host.

pub mod agent;
pub mod driver;
pub mod timing;
pub mod topology;
