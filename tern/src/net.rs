//! Network addressing: endpoints and parsed UDP channel URIs.
//!
//! Socket I/O belongs to the Sender and Receiver agents; the conductor only
//! needs to name destinations and compare them canonically.

pub mod endpoint;
pub mod udp_channel;

pub use endpoint::Endpoint;
pub use udp_channel::{ChannelError, UdpChannel};
