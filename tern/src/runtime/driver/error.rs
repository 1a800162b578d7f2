//! Errors raised while handling conductor commands.

use thiserror::Error;

use super::config::ConfigError;
use super::proxy::QueueFull;
use crate::buffer::LogError;
use crate::control::DecodeError;
use crate::control::types::{CorrelationId, ErrorCode};
use crate::counters::CountersError;
use crate::net::ChannelError;
use crate::runtime::timing::WheelError;

/// A failure reported back to the client that sent the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ControlProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ControlProtocolError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn duplicate_registration(registration_id: CorrelationId) -> Self {
        Self::new(
            ErrorCode::GenericError,
            format!("registration id already in use: {registration_id}"),
        )
    }

    #[must_use]
    pub fn unknown_publication(registration_id: CorrelationId) -> Self {
        Self::new(
            ErrorCode::UnknownPublication,
            format!("unknown publication: {registration_id}"),
        )
    }

    #[must_use]
    pub fn unknown_subscription(registration_id: CorrelationId) -> Self {
        Self::new(
            ErrorCode::UnknownSubscription,
            format!("unknown subscription: {registration_id}"),
        )
    }

    #[must_use]
    pub fn invalid_channel(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidChannel, message)
    }
}

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error(transparent)]
    Protocol(#[from] ControlProtocolError),
    #[error("invalid channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("counters: {0}")]
    Counters(#[from] CountersError),
    #[error("log buffer: {0}")]
    Log(#[from] LogError),
    #[error("malformed command: {0}")]
    Decode(#[from] DecodeError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("timer wheel: {0}")]
    Wheel(#[from] WheelError),
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    #[error("command handler panicked: {0}")]
    Panicked(String),
}

impl ConductorError {
    /// Code sent to the client for this failure.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Protocol(e) => e.code,
            Self::Channel(_) => ErrorCode::InvalidChannel,
            _ => ErrorCode::GenericError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_failure_kind() {
        let dup: ConductorError = ControlProtocolError::duplicate_registration(CorrelationId(100)).into();
        assert_eq!(dup.error_code(), ErrorCode::GenericError);
        assert_eq!(
            dup.to_string(),
            "registration id already in use: 100"
        );

        let channel: ConductorError = ChannelError::MissingPort("udp://x".into()).into();
        assert_eq!(channel.error_code(), ErrorCode::InvalidChannel);

        let unknown: ConductorError = ControlProtocolError::unknown_subscription(CorrelationId(3)).into();
        assert_eq!(unknown.error_code(), ErrorCode::UnknownSubscription);

        let decode: ConductorError = DecodeError::InvalidUtf8.into();
        assert_eq!(decode.error_code(), ErrorCode::GenericError);

        let full: ConductorError = QueueFull {
            agent: "sender",
            command: "NewPublication",
        }
        .into();
        assert_eq!(full.error_code(), ErrorCode::GenericError);
        assert_eq!(
            full.to_string(),
            "sender command queue full, NewPublication not delivered"
        );
    }
}
