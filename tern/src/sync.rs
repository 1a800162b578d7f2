//! Bounded lock-free queues for hand-off between the driver's threads.
//!
//! - `spsc`: one producer, one consumer. Conductor to Sender/Receiver, Receiver
//!   to Conductor, and Conductor to clients.
//! - `mpsc`: many producers, one consumer. The client command buffer and the
//!   event log.

pub mod mpsc;
pub mod spsc;

/// Capacity used for every inter-thread command queue and the client queues.
///
/// These carry control-plane messages only; the conductor drains them every
/// duty cycle so bursts of a few hundred commands never back up.
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;
