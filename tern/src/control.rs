//! Client-facing control protocol.
//!
//! Clients submit [`ClientCommand`]s through a [`DriverProxy`] into the shared
//! [`ToDriverBuffer`]; the conductor answers through a [`ClientProxy`] with
//! [`DriverResponse`]s.

pub mod client_proxy;
pub mod command;
pub mod to_driver;
pub mod types;

pub use client_proxy::{ClientProxy, ResponseConsumer, response_channel};
pub use command::{ClientCommand, DecodeError, msg_type};
pub use to_driver::{CommandFrame, DriverProxy, SubmitError, ToDriverBuffer, ToDriverHandle};
pub use types::{
    ClientId, CorrelationId, CounterId, DriverResponse, ErrorCode, SessionId, StreamId,
    SubscriberPositionInfo,
};
