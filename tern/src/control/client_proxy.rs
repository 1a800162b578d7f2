//! Conductor side of the driver to client response queue.

use std::sync::Arc;

use super::types::{
    CorrelationId, CounterId, DriverResponse, ErrorCode, SessionId, StreamId,
    SubscriberPositionInfo,
};
use crate::buffer::RawLog;
use crate::counters::Position;
use crate::sync::{COMMAND_QUEUE_CAPACITY, spsc};
use crate::trace::warn;

/// Read end handed to the client library.
pub type ResponseConsumer = spsc::Consumer<DriverResponse, COMMAND_QUEUE_CAPACITY>;

/// Creates the response queue.
#[must_use]
pub fn response_channel() -> (ClientProxy, ResponseConsumer) {
    let (producer, consumer) = spsc::channel::<DriverResponse, COMMAND_QUEUE_CAPACITY>();
    (
        ClientProxy {
            producer,
            dropped: None,
        },
        consumer,
    )
}

/// Sends replies and notifications to clients. Never blocks: a full queue
/// drops the response and counts it.
pub struct ClientProxy {
    producer: spsc::Producer<DriverResponse, COMMAND_QUEUE_CAPACITY>,
    dropped: Option<Position>,
}

/// Fields of a connection-ready notification.
pub struct ConnectionReady<'a> {
    pub channel: &'a str,
    pub stream_id: StreamId,
    pub session_id: SessionId,
    pub joining_position: i64,
    pub log: &'a Arc<RawLog>,
    pub correlation_id: CorrelationId,
    pub subscriber_positions: Vec<SubscriberPositionInfo>,
    pub source_info: String,
}

impl ClientProxy {
    /// Counts every dropped response in `dropped`.
    #[must_use]
    pub fn with_drop_counter(mut self, dropped: Position) -> Self {
        self.dropped = Some(dropped);
        self
    }

    pub fn on_publication_ready(
        &self,
        channel: &str,
        stream_id: StreamId,
        session_id: SessionId,
        log: &Arc<RawLog>,
        correlation_id: CorrelationId,
        publisher_limit_id: CounterId,
    ) {
        self.send(DriverResponse::PublicationReady {
            channel: channel.to_owned(),
            stream_id,
            session_id,
            log_id: log.log_id().to_owned(),
            log: Arc::clone(log),
            correlation_id,
            publisher_limit_id,
        });
    }

    pub fn on_connection_ready(&self, ready: ConnectionReady<'_>) {
        self.send(DriverResponse::ConnectionReady {
            channel: ready.channel.to_owned(),
            stream_id: ready.stream_id,
            session_id: ready.session_id,
            joining_position: ready.joining_position,
            log_id: ready.log.log_id().to_owned(),
            log: Arc::clone(ready.log),
            correlation_id: ready.correlation_id,
            subscriber_positions: ready.subscriber_positions,
            source_info: ready.source_info,
        });
    }

    pub fn on_inactive_connection(
        &self,
        correlation_id: CorrelationId,
        session_id: SessionId,
        stream_id: StreamId,
        rebuild_position: i64,
        channel: &str,
    ) {
        self.send(DriverResponse::InactiveConnection {
            correlation_id,
            session_id,
            stream_id,
            rebuild_position,
            channel: channel.to_owned(),
        });
    }

    pub fn on_operation_succeeded(&self, correlation_id: CorrelationId) {
        self.send(DriverResponse::OperationSucceeded { correlation_id });
    }

    pub fn on_error(
        &self,
        code: ErrorCode,
        message: String,
        offending_msg_type_id: i32,
        offending_correlation_id: Option<CorrelationId>,
        offending_length: usize,
    ) {
        self.send(DriverResponse::Error {
            code,
            message,
            offending_msg_type_id,
            offending_correlation_id,
            offending_length,
        });
    }

    fn send(&self, response: DriverResponse) {
        if let Err(_dropped) = self.producer.push(response) {
            if let Some(dropped) = &self.dropped {
                dropped.increment();
            }
            warn!(
                correlation_id = ?_dropped.correlation_id(),
                "client response queue full, dropping response"
            );
        }
    }
}
