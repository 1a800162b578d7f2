//! Identifiers and replies shared by clients and the driver.

use std::fmt;
use std::sync::Arc;

use crate::buffer::RawLog;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($repr:ty), $fmt:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(pub $repr);

        impl $name {
            #[must_use]
            pub const fn get(self) -> $repr {
                self.0
            }
        }

        impl From<$repr> for $name {
            fn from(v: $repr) -> Self {
                Self(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $fmt, self.0)
            }
        }
    };
}

id_newtype!(
    /// Identity of a client process, chosen by the client.
    ClientId(i64),
    "{}"
);
id_newtype!(
    /// Correlation id carried by a command; doubles as the registration id of
    /// the link the command creates.
    CorrelationId(i64),
    "{}"
);
id_newtype!(
    /// One sender's instance of a stream.
    SessionId(i32),
    "{:x}"
);
id_newtype!(
    /// Application stream identifier.
    StreamId(i32),
    "{:x}"
);
id_newtype!(
    /// Slot in the counters region.
    CounterId(i32),
    "{}"
);

/// Error codes sent to clients. Values are stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    GenericError = 0,
    InvalidChannel = 1,
    UnknownSubscription = 2,
    UnknownPublication = 3,
}

impl ErrorCode {
    #[must_use]
    pub const fn value(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GenericError => "GENERIC_ERROR",
            Self::InvalidChannel => "INVALID_CHANNEL",
            Self::UnknownSubscription => "UNKNOWN_SUBSCRIPTION",
            Self::UnknownPublication => "UNKNOWN_PUBLICATION",
        };
        f.write_str(name)
    }
}

/// A subscriber position handed out with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberPositionInfo {
    /// Registration id of the subscription the position belongs to.
    pub registration_id: CorrelationId,
    pub counter_id: CounterId,
}

/// Driver to client replies and notifications.
#[derive(Debug, Clone)]
pub enum DriverResponse {
    PublicationReady {
        channel: String,
        stream_id: StreamId,
        session_id: SessionId,
        log_id: String,
        log: Arc<RawLog>,
        correlation_id: CorrelationId,
        publisher_limit_id: CounterId,
    },
    ConnectionReady {
        channel: String,
        stream_id: StreamId,
        session_id: SessionId,
        joining_position: i64,
        log_id: String,
        log: Arc<RawLog>,
        correlation_id: CorrelationId,
        subscriber_positions: Vec<SubscriberPositionInfo>,
        source_info: String,
    },
    InactiveConnection {
        correlation_id: CorrelationId,
        session_id: SessionId,
        stream_id: StreamId,
        rebuild_position: i64,
        channel: String,
    },
    OperationSucceeded {
        correlation_id: CorrelationId,
    },
    Error {
        code: ErrorCode,
        message: String,
        /// Type id of the command that failed.
        offending_msg_type_id: i32,
        /// Correlation id of the failed command, when it could be decoded.
        offending_correlation_id: Option<CorrelationId>,
        /// Encoded length of the command that failed.
        offending_length: usize,
    },
}

impl DriverResponse {
    /// Correlation id the reply answers, if any.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::PublicationReady { correlation_id, .. }
            | Self::ConnectionReady { correlation_id, .. }
            | Self::InactiveConnection { correlation_id, .. }
            | Self::OperationSucceeded { correlation_id } => Some(*correlation_id),
            Self::Error {
                offending_correlation_id,
                ..
            } => *offending_correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::GenericError.value(), 0);
        assert_eq!(ErrorCode::InvalidChannel.value(), 1);
        assert_eq!(ErrorCode::UnknownSubscription.value(), 2);
        assert_eq!(ErrorCode::UnknownPublication.value(), 3);
        assert_eq!(ErrorCode::UnknownPublication.to_string(), "UNKNOWN_PUBLICATION");
    }

    #[test]
    fn ids_display_like_counter_labels() {
        assert_eq!(SessionId(42).to_string(), "2a");
        assert_eq!(StreamId(7).to_string(), "7");
        assert_eq!(CorrelationId(100).to_string(), "100");
    }
}
