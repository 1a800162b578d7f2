//! `tern`: the control plane of a UDP log-buffer transport driver.
//!
//! The [`DriverConductor`](runtime::driver::DriverConductor) owns every channel
//! endpoint, publication, subscription and connection. Clients talk to it
//! through the [`ToDriverBuffer`](control::ToDriverBuffer); it talks to the
//! Sender and Receiver agents through bounded SPSC command queues.

pub mod buffer;
pub mod control;
pub mod counters;
pub mod events;
pub mod net;
pub mod runtime;
pub mod sync;
pub mod trace;

pub use trace::init_tracing;
