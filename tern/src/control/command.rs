//! Client control commands and their payload codec.
//!
//! Every command travels as a `(msg_type_id, payload)` pair on the client command buffer.
//! Payloads are little-endian. Each starts with a correlated header:
//!
//! ```text
//! client_id: i64 | correlation_id: i64 | <command fields>
//! ```
//!
//! Strings are encoded as an `i32` byte length followed by UTF-8 bytes.

use thiserror::Error;

use super::types::{ClientId, CorrelationId, SessionId, StreamId};

/// Message type ids on the client command buffer.
pub mod msg_type {
    pub const ADD_PUBLICATION: i32 = 0x01;
    pub const REMOVE_PUBLICATION: i32 = 0x02;
    pub const ADD_SUBSCRIPTION: i32 = 0x04;
    pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
    pub const CLIENT_KEEPALIVE: i32 = 0x06;
}

/// Length of the correlated header every payload starts with.
pub const CORRELATED_HEADER_LENGTH: usize = 16;

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    AddPublication {
        client_id: ClientId,
        correlation_id: CorrelationId,
        session_id: SessionId,
        stream_id: StreamId,
        channel: String,
    },
    RemovePublication {
        client_id: ClientId,
        correlation_id: CorrelationId,
        /// Correlation id of the `AddPublication` that created the link.
        registration_id: CorrelationId,
    },
    AddSubscription {
        client_id: ClientId,
        correlation_id: CorrelationId,
        stream_id: StreamId,
        channel: String,
    },
    RemoveSubscription {
        client_id: ClientId,
        correlation_id: CorrelationId,
        registration_id: CorrelationId,
    },
    ClientKeepalive {
        client_id: ClientId,
    },
}

/// Errors decoding a command payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("negative string length {0}")]
    NegativeLength(i32),
    #[error("channel is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(i32),
}

impl ClientCommand {
    #[must_use]
    pub const fn msg_type_id(&self) -> i32 {
        match self {
            Self::AddPublication { .. } => msg_type::ADD_PUBLICATION,
            Self::RemovePublication { .. } => msg_type::REMOVE_PUBLICATION,
            Self::AddSubscription { .. } => msg_type::ADD_SUBSCRIPTION,
            Self::RemoveSubscription { .. } => msg_type::REMOVE_SUBSCRIPTION,
            Self::ClientKeepalive { .. } => msg_type::CLIENT_KEEPALIVE,
        }
    }

    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        match self {
            Self::AddPublication { client_id, .. }
            | Self::RemovePublication { client_id, .. }
            | Self::AddSubscription { client_id, .. }
            | Self::RemoveSubscription { client_id, .. }
            | Self::ClientKeepalive { client_id } => *client_id,
        }
    }

    /// Correlation id of the command; keepalives carry none.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::AddPublication { correlation_id, .. }
            | Self::RemovePublication { correlation_id, .. }
            | Self::AddSubscription { correlation_id, .. }
            | Self::RemoveSubscription { correlation_id, .. } => Some(*correlation_id),
            Self::ClientKeepalive { .. } => None,
        }
    }

    /// Encodes the payload into `buf`, clearing it first.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut w = CommandWriter::new(buf);
        w.put_i64(self.client_id().get());
        w.put_i64(self.correlation_id().map_or(0, CorrelationId::get));

        match self {
            Self::AddPublication {
                session_id,
                stream_id,
                channel,
                ..
            } => {
                w.put_i32(session_id.get());
                w.put_i32(stream_id.get());
                w.put_str(channel);
            }
            Self::AddSubscription {
                stream_id, channel, ..
            } => {
                w.put_i32(stream_id.get());
                w.put_str(channel);
            }
            Self::RemovePublication {
                registration_id, ..
            }
            | Self::RemoveSubscription {
                registration_id, ..
            } => w.put_i64(registration_id.get()),
            Self::ClientKeepalive { .. } => {}
        }
    }

    /// Decodes a payload of the given message type.
    ///
    /// # Errors
    /// [`DecodeError::UnknownType`] for unrecognised type ids, otherwise a truncation or
    /// string error if the payload is malformed.
    pub fn decode(msg_type_id: i32, payload: &[u8]) -> Result<Self, DecodeError> {
        if !is_known(msg_type_id) {
            return Err(DecodeError::UnknownType(msg_type_id));
        }

        let mut r = CommandReader::new(payload);
        let client_id = ClientId(r.take_i64()?);
        let correlation_id = CorrelationId(r.take_i64()?);

        let command = match msg_type_id {
            msg_type::ADD_PUBLICATION => Self::AddPublication {
                client_id,
                correlation_id,
                session_id: SessionId(r.take_i32()?),
                stream_id: StreamId(r.take_i32()?),
                channel: r.take_str()?,
            },
            msg_type::REMOVE_PUBLICATION => Self::RemovePublication {
                client_id,
                correlation_id,
                registration_id: CorrelationId(r.take_i64()?),
            },
            msg_type::ADD_SUBSCRIPTION => Self::AddSubscription {
                client_id,
                correlation_id,
                stream_id: StreamId(r.take_i32()?),
                channel: r.take_str()?,
            },
            msg_type::REMOVE_SUBSCRIPTION => Self::RemoveSubscription {
                client_id,
                correlation_id,
                registration_id: CorrelationId(r.take_i64()?),
            },
            _ => Self::ClientKeepalive { client_id },
        };
        Ok(command)
    }
}

const fn is_known(msg_type_id: i32) -> bool {
    matches!(
        msg_type_id,
        msg_type::ADD_PUBLICATION
            | msg_type::REMOVE_PUBLICATION
            | msg_type::ADD_SUBSCRIPTION
            | msg_type::REMOVE_SUBSCRIPTION
            | msg_type::CLIENT_KEEPALIVE
    )
}

/// Best-effort correlation id of a payload that failed to decode.
#[must_use]
pub fn peek_correlation_id(payload: &[u8]) -> Option<CorrelationId> {
    let mut r = CommandReader::new(payload);
    r.take_i64().ok()?;
    r.take_i64().ok().map(CorrelationId)
}

struct CommandWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> CommandWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, s: &str) {
        let len = i32::try_from(s.len()).unwrap_or(i32::MAX);
        self.put_i32(len);
        self.buf.extend_from_slice(&s.as_bytes()[..len as usize]);
    }
}

struct CommandReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> CommandReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take<const W: usize>(&mut self) -> Result<[u8; W], DecodeError> {
        if self.remaining() < W {
            return Err(DecodeError::Truncated {
                need: W,
                have: self.remaining(),
            });
        }
        let mut arr = [0u8; W];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + W]);
        self.cursor += W;
        Ok(arr)
    }

    fn take_i32(&mut self) -> Result<i32, DecodeError> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    fn take_i64(&mut self) -> Result<i64, DecodeError> {
        self.take::<8>().map(i64::from_le_bytes)
    }

    fn take_str(&mut self) -> Result<String, DecodeError> {
        let len = self.take_i32()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::NegativeLength(len))?;
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                need: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.cursor..self.cursor + len];
        self.cursor += len;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}
