//! Inter-agent command types.
//!
//! These travel between the conductor and its two satellite agents over
//! bounded SPSC queues. They are NOT part of the client-facing protocol.
//!
//! Command flows:
//! - Conductor → Sender: endpoint registration, new and closed publications
//! - Conductor → Receiver: endpoint registration, stream (un)subscribe, new and removed connections
//! - Receiver → Conductor: a new remote session was seen on an endpoint

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use super::connection::ConnectionHandle;
use super::flow_control::FlowControl;
use super::loss::LossGenerator;
use super::publication::PublicationHandle;
use super::retransmit::RetransmitHandler;
use crate::control::types::{SessionId, StreamId};
use crate::net::{Endpoint, UdpChannel};

/// Commands from the conductor to the Sender.
pub enum SenderCommand {
    /// Open the socket for a new send endpoint.
    RegisterSendChannelEndpoint {
        channel: UdpChannel,
        /// Drops inbound status messages and NAKs at the configured rate.
        control_loss: LossGenerator,
    },

    /// Start sending a publication.
    NewPublication {
        publication: PublicationHandle,
        retransmit: RetransmitHandler,
        flow_control: Box<dyn FlowControl>,
    },

    /// Stop sending a publication and drop the Sender's handle on it.
    ///
    /// The Sender sets `released` once it no longer writes the publication's
    /// positions; the conductor frees their counters only after that.
    ClosePublication {
        canonical: String,
        session_id: SessionId,
        stream_id: StreamId,
        released: Arc<AtomicBool>,
    },

    /// Close the socket of an endpoint with no publications left.
    CloseSendChannelEndpoint { canonical: String },
}

/// Commands from the conductor to the Receiver.
pub enum ReceiverCommand {
    /// Open the socket for a new receive endpoint.
    RegisterReceiveChannelEndpoint {
        channel: UdpChannel,
        /// Drops inbound data frames at the configured rate.
        data_loss: LossGenerator,
    },

    /// Start accepting a stream on an endpoint.
    AddSubscription { canonical: String, stream_id: StreamId },

    /// Stop accepting a stream; frames for it are dropped from now on.
    RemoveSubscription { canonical: String, stream_id: StreamId },

    /// Start rebuilding a connection into its log.
    NewConnection { connection: ConnectionHandle },

    /// Drop the Receiver's handle on a connection.
    ///
    /// The Receiver sets `released` once it no longer writes the connection's
    /// positions; the conductor frees their counters only after that.
    RemoveConnection {
        canonical: String,
        session_id: SessionId,
        stream_id: StreamId,
        released: Arc<AtomicBool>,
    },

    /// Close an endpoint's socket.
    ///
    /// The Receiver sets `closed` once no further frames can arrive; the
    /// conductor waits on it before reusing the address.
    CloseReceiveChannelEndpoint {
        canonical: String,
        closed: Arc<AtomicBool>,
    },
}

/// Commands from the Receiver to the conductor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConductorCommand {
    /// A data or setup frame arrived for a session the Receiver has no connection for.
    CreateConnection {
        canonical: String,
        session_id: SessionId,
        stream_id: StreamId,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: i32,
        term_length: usize,
        /// Sender's MTU.
        mtu_length: usize,
        /// Sender's initial receiver window.
        window_length: usize,
        /// Where status messages go.
        control_address: Endpoint,
        /// Where the frames came from.
        source_address: Endpoint,
    },
}

impl SenderCommand {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RegisterSendChannelEndpoint { .. } => "RegisterSendChannelEndpoint",
            Self::NewPublication { .. } => "NewPublication",
            Self::ClosePublication { .. } => "ClosePublication",
            Self::CloseSendChannelEndpoint { .. } => "CloseSendChannelEndpoint",
        }
    }
}

impl ReceiverCommand {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RegisterReceiveChannelEndpoint { .. } => "RegisterReceiveChannelEndpoint",
            Self::AddSubscription { .. } => "AddSubscription",
            Self::RemoveSubscription { .. } => "RemoveSubscription",
            Self::NewConnection { .. } => "NewConnection",
            Self::RemoveConnection { .. } => "RemoveConnection",
            Self::CloseReceiveChannelEndpoint { .. } => "CloseReceiveChannelEndpoint",
        }
    }
}
