//! The client command buffer: many clients write, the conductor reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use thiserror::Error;

use super::command::ClientCommand;
use super::types::{ClientId, CorrelationId, SessionId, StreamId};
use crate::runtime::timing::NanoTime;
use crate::sync::COMMAND_QUEUE_CAPACITY;
use crate::sync::mpsc;

/// One encoded command as it sits in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub msg_type_id: i32,
    pub payload: Vec<u8>,
}

/// Error submitting a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("client command buffer is full")]
    BufferFull,
}

#[derive(Debug)]
struct SharedState {
    consumer_heartbeat_ns: AtomicU64,
    next_correlation_id: AtomicI64,
}

/// Reading end, owned by the conductor.
pub struct ToDriverBuffer {
    consumer: mpsc::Consumer<CommandFrame, COMMAND_QUEUE_CAPACITY>,
    state: Arc<SharedState>,
}

impl ToDriverBuffer {
    #[must_use]
    pub fn new() -> Self {
        let (_, consumer) = mpsc::channel::<CommandFrame, COMMAND_QUEUE_CAPACITY>();
        Self {
            consumer,
            state: Arc::new(SharedState {
                consumer_heartbeat_ns: AtomicU64::new(0),
                next_correlation_id: AtomicI64::new(1),
            }),
        }
    }

    /// A shareable handle for attaching clients once the buffer has moved
    /// to the conductor thread.
    #[must_use]
    pub fn handle(&self) -> ToDriverHandle {
        ToDriverHandle {
            producer: self.consumer.producer(),
            state: Arc::clone(&self.state),
        }
    }

    /// A new client writing into this buffer.
    #[must_use]
    pub fn client(&self, client_id: ClientId) -> DriverProxy {
        self.handle().client(client_id)
    }

    /// Hands every frame visible now to `handler`; returns how many were read.
    pub fn read(&self, handler: impl FnMut(CommandFrame)) -> usize {
        self.consumer.drain(COMMAND_QUEUE_CAPACITY, handler)
    }

    /// Draws from the same generator clients use, so driver-assigned ids never
    /// collide with client registrations.
    #[must_use]
    pub fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId(self.state.next_correlation_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Publishes the conductor's liveness timestamp to clients.
    pub fn set_consumer_heartbeat(&self, now: NanoTime) {
        self.state
            .consumer_heartbeat_ns
            .store(now.as_u64(), Ordering::Release);
    }

    #[must_use]
    pub fn consumer_heartbeat(&self) -> NanoTime {
        NanoTime::new(self.state.consumer_heartbeat_ns.load(Ordering::Acquire))
    }
}

impl Default for ToDriverBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Write access to the buffer, shareable across threads.
#[derive(Clone)]
pub struct ToDriverHandle {
    producer: mpsc::Producer<CommandFrame, COMMAND_QUEUE_CAPACITY>,
    state: Arc<SharedState>,
}

impl ToDriverHandle {
    #[must_use]
    pub fn client(&self, client_id: ClientId) -> DriverProxy {
        DriverProxy {
            client_id,
            producer: self.producer.clone(),
            state: Arc::clone(&self.state),
            scratch: Vec::with_capacity(64),
        }
    }
}

/// Client-side helper that encodes commands into the buffer.
#[derive(Clone)]
pub struct DriverProxy {
    client_id: ClientId,
    producer: mpsc::Producer<CommandFrame, COMMAND_QUEUE_CAPACITY>,
    state: Arc<SharedState>,
    scratch: Vec<u8>,
}

impl DriverProxy {
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Draws a driver-wide unique correlation id.
    #[must_use]
    pub fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId(self.state.next_correlation_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Last time the conductor swept; clients use it to detect a dead driver.
    #[must_use]
    pub fn consumer_heartbeat(&self) -> NanoTime {
        NanoTime::new(self.state.consumer_heartbeat_ns.load(Ordering::Acquire))
    }

    /// # Errors
    /// [`SubmitError::BufferFull`] if the buffer has no room.
    pub fn add_publication(
        &mut self,
        channel: &str,
        session_id: SessionId,
        stream_id: StreamId,
    ) -> Result<CorrelationId, SubmitError> {
        let correlation_id = self.next_correlation_id();
        self.submit(&ClientCommand::AddPublication {
            client_id: self.client_id,
            correlation_id,
            session_id,
            stream_id,
            channel: channel.to_owned(),
        })?;
        Ok(correlation_id)
    }

    /// # Errors
    /// [`SubmitError::BufferFull`] if the buffer has no room.
    pub fn remove_publication(
        &mut self,
        registration_id: CorrelationId,
    ) -> Result<CorrelationId, SubmitError> {
        let correlation_id = self.next_correlation_id();
        self.submit(&ClientCommand::RemovePublication {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        })?;
        Ok(correlation_id)
    }

    /// # Errors
    /// [`SubmitError::BufferFull`] if the buffer has no room.
    pub fn add_subscription(
        &mut self,
        channel: &str,
        stream_id: StreamId,
    ) -> Result<CorrelationId, SubmitError> {
        let correlation_id = self.next_correlation_id();
        self.submit(&ClientCommand::AddSubscription {
            client_id: self.client_id,
            correlation_id,
            stream_id,
            channel: channel.to_owned(),
        })?;
        Ok(correlation_id)
    }

    /// # Errors
    /// [`SubmitError::BufferFull`] if the buffer has no room.
    pub fn remove_subscription(
        &mut self,
        registration_id: CorrelationId,
    ) -> Result<CorrelationId, SubmitError> {
        let correlation_id = self.next_correlation_id();
        self.submit(&ClientCommand::RemoveSubscription {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        })?;
        Ok(correlation_id)
    }

    /// # Errors
    /// [`SubmitError::BufferFull`] if the buffer has no room.
    pub fn send_keepalive(&mut self) -> Result<(), SubmitError> {
        self.submit(&ClientCommand::ClientKeepalive {
            client_id: self.client_id,
        })
    }

    /// Submits an already encoded frame, e.g. one carrying an unknown type.
    ///
    /// # Errors
    /// [`SubmitError::BufferFull`] if the buffer has no room.
    pub fn submit_raw(&self, frame: CommandFrame) -> Result<(), SubmitError> {
        self.producer
            .push(frame)
            .map_err(|_| SubmitError::BufferFull)
    }

    /// Encodes and submits a command as given, keeping its ids.
    ///
    /// # Errors
    /// [`SubmitError::BufferFull`] if the buffer has no room.
    pub fn submit(&mut self, command: &ClientCommand) -> Result<(), SubmitError> {
        command.encode(&mut self.scratch);
        self.submit_raw(CommandFrame {
            msg_type_id: command.msg_type_id(),
            payload: self.scratch.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::command::msg_type;

    #[test]
    fn commands_arrive_in_order() {
        let buffer = ToDriverBuffer::new();
        let mut client = buffer.client(ClientId(3));

        let add = client
            .add_publication("udp://localhost:40123", SessionId(1), StreamId(2))
            .unwrap();
        client.send_keepalive().unwrap();

        let mut frames = Vec::new();
        assert_eq!(buffer.read(|f| frames.push(f)), 2);
        assert_eq!(frames[0].msg_type_id, msg_type::ADD_PUBLICATION);
        assert_eq!(frames[1].msg_type_id, msg_type::CLIENT_KEEPALIVE);

        let decoded = ClientCommand::decode(frames[0].msg_type_id, &frames[0].payload).unwrap();
        assert_eq!(decoded.correlation_id(), Some(add));
        assert_eq!(decoded.client_id(), ClientId(3));
    }

    #[test]
    fn correlation_ids_are_unique_across_clients() {
        let buffer = ToDriverBuffer::new();
        let a = buffer.client(ClientId(1));
        let b = buffer.client(ClientId(2));
        let ids = [
            a.next_correlation_id(),
            b.next_correlation_id(),
            a.next_correlation_id(),
        ];
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
    }

    #[test]
    fn heartbeat_visible_to_clients() {
        let buffer = ToDriverBuffer::new();
        let client = buffer.client(ClientId(1));
        buffer.set_consumer_heartbeat(NanoTime::new(1_000));
        assert_eq!(client.consumer_heartbeat(), NanoTime::new(1_000));
        assert_eq!(buffer.consumer_heartbeat(), NanoTime::new(1_000));
    }

    #[test]
    fn full_buffer_reports_error() {
        let buffer = ToDriverBuffer::new();
        let mut client = buffer.client(ClientId(1));
        for _ in 0..COMMAND_QUEUE_CAPACITY {
            client.send_keepalive().unwrap();
        }
        assert_eq!(client.send_keepalive(), Err(SubmitError::BufferFull));
    }
}
