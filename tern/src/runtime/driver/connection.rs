//! Receive-side stream instances and their liveness state machine.
//!
//! ```text
//! ACTIVE --drained or stalled--> INACTIVE --clients notified--> LINGER --timeout--> removed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::buffer::RawLog;
use crate::control::types::{CorrelationId, SessionId, StreamId, SubscriberPositionInfo};
use crate::counters::Position;
use crate::net::Endpoint;
use crate::runtime::timing::{NanoDuration, NanoTime};

/// State the Receiver writes as frames arrive and the conductor reads each sweep.
#[derive(Debug)]
pub struct ConnectionActivity {
    rebuild_position: AtomicI64,
    time_of_last_frame_ns: AtomicU64,
    end_of_stream: AtomicBool,
    /// Slowest subscriber, published by the conductor for the Receiver's window.
    subscriber_position: AtomicI64,
}

impl ConnectionActivity {
    #[must_use]
    pub fn new(joining_position: i64, now: NanoTime) -> Self {
        Self {
            rebuild_position: AtomicI64::new(joining_position),
            time_of_last_frame_ns: AtomicU64::new(now.as_u64()),
            end_of_stream: AtomicBool::new(false),
            subscriber_position: AtomicI64::new(joining_position),
        }
    }

    /// Receiver side: a frame arrived.
    pub fn record_frame(&self, now: NanoTime) {
        self.time_of_last_frame_ns
            .store(now.as_u64(), Ordering::Release);
    }

    /// Receiver side: highest contiguously rebuilt position.
    pub fn set_rebuild_position(&self, position: i64) {
        self.rebuild_position.store(position, Ordering::Release);
    }

    /// Receiver side: the sender signalled the end of the stream.
    pub fn mark_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn rebuild_position(&self) -> i64 {
        self.rebuild_position.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn time_of_last_frame(&self) -> NanoTime {
        NanoTime::new(self.time_of_last_frame_ns.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn subscriber_position(&self) -> i64 {
        self.subscriber_position.load(Ordering::Acquire)
    }

    fn set_subscriber_position(&self, position: i64) {
        self.subscriber_position.store(position, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Linger,
}

/// What the Receiver needs to rebuild a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub correlation_id: CorrelationId,
    pub canonical: String,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub log: Arc<RawLog>,
    pub activity: Arc<ConnectionActivity>,
    /// Written by the Receiver.
    pub hwm_position: Position,
    pub control_address: Endpoint,
    pub source_address: Endpoint,
}

/// A receive-side stream instance. Subscriber positions are keyed by the
/// registration id of the subscription that owns them.
#[derive(Debug)]
pub struct NetworkConnection {
    correlation_id: CorrelationId,
    canonical: String,
    channel_uri: String,
    session_id: SessionId,
    stream_id: StreamId,
    log: Arc<RawLog>,
    activity: Arc<ConnectionActivity>,
    hwm_position: Position,
    subscriber_positions: Vec<(CorrelationId, Position)>,
    status: ConnectionStatus,
    time_of_last_status_change: NanoTime,
    joining_position: i64,
    cleaned_position: i64,
    control_address: Endpoint,
    source_address: Endpoint,
}

/// Fields needed to build a [`NetworkConnection`].
pub struct ConnectionParams {
    pub correlation_id: CorrelationId,
    pub canonical: String,
    pub channel_uri: String,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub log: Arc<RawLog>,
    pub hwm_position: Position,
    pub subscriber_positions: Vec<(CorrelationId, Position)>,
    pub joining_position: i64,
    pub control_address: Endpoint,
    pub source_address: Endpoint,
}

impl NetworkConnection {
    #[must_use]
    pub fn new(params: ConnectionParams, now: NanoTime) -> Self {
        Self {
            correlation_id: params.correlation_id,
            canonical: params.canonical,
            channel_uri: params.channel_uri,
            session_id: params.session_id,
            stream_id: params.stream_id,
            log: params.log,
            activity: Arc::new(ConnectionActivity::new(params.joining_position, now)),
            hwm_position: params.hwm_position,
            subscriber_positions: params.subscriber_positions,
            status: ConnectionStatus::Active,
            time_of_last_status_change: now,
            joining_position: params.joining_position,
            cleaned_position: params.joining_position,
            control_address: params.control_address,
            source_address: params.source_address,
        }
    }

    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    #[must_use]
    pub fn channel_uri(&self) -> &str {
        &self.channel_uri
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub const fn log(&self) -> &Arc<RawLog> {
        &self.log
    }

    #[must_use]
    pub const fn activity(&self) -> &Arc<ConnectionActivity> {
        &self.activity
    }

    #[must_use]
    pub const fn hwm_position(&self) -> &Position {
        &self.hwm_position
    }

    #[must_use]
    pub const fn joining_position(&self) -> i64 {
        self.joining_position
    }

    #[must_use]
    pub const fn source_address(&self) -> Endpoint {
        self.source_address
    }

    #[must_use]
    pub fn rebuild_position(&self) -> i64 {
        self.activity.rebuild_position()
    }

    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[must_use]
    pub const fn time_of_last_status_change(&self) -> NanoTime {
        self.time_of_last_status_change
    }

    pub fn set_status(&mut self, status: ConnectionStatus, now: NanoTime) {
        self.status = status;
        self.time_of_last_status_change = now;
    }

    pub fn matches(&self, canonical: &str, stream_id: StreamId) -> bool {
        self.stream_id == stream_id && self.canonical == canonical
    }

    pub fn add_subscriber(&mut self, registration_id: CorrelationId, position: Position) {
        self.subscriber_positions.push((registration_id, position));
    }

    /// Detaches a subscription's position. The caller frees the counter.
    pub fn remove_subscriber(&mut self, registration_id: CorrelationId) -> Option<Position> {
        let index = self
            .subscriber_positions
            .iter()
            .position(|(id, _)| *id == registration_id)?;
        Some(self.subscriber_positions.swap_remove(index).1)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_positions.len()
    }

    #[must_use]
    pub fn subscriber_positions(&self) -> &[(CorrelationId, Position)] {
        &self.subscriber_positions
    }

    #[must_use]
    pub fn subscriber_position_infos(&self) -> Vec<SubscriberPositionInfo> {
        self.subscriber_positions
            .iter()
            .map(|(registration_id, position)| SubscriberPositionInfo {
                registration_id: *registration_id,
                counter_id: position.id(),
            })
            .collect()
    }

    /// Takes every counter the connection holds, subscriber positions first.
    pub fn take_positions(&mut self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .subscriber_positions
            .drain(..)
            .map(|(_, position)| position)
            .collect();
        positions.push(self.hwm_position.clone());
        positions
    }

    /// End of stream seen and every subscriber has consumed up to the rebuild position.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let rebuild = self.rebuild_position();
        self.activity.is_end_of_stream()
            && self
                .subscriber_positions
                .iter()
                .all(|(_, position)| position.get() >= rebuild)
    }

    /// No frame for longer than `timeout`.
    #[must_use]
    pub fn is_stalled(&self, now: NanoTime, timeout: NanoDuration) -> bool {
        now > self.activity.time_of_last_frame() + timeout
    }

    /// Publishes the slowest subscriber to the Receiver and zeroes log bytes
    /// more than a term behind it. Returns bytes cleaned.
    pub fn track_rebuild(&mut self) -> usize {
        let Some(min) = self
            .subscriber_positions
            .iter()
            .map(|(_, position)| position.get())
            .min()
        else {
            return 0;
        };
        self.activity.set_subscriber_position(min);

        let dirty_limit = min - self.log.term_length() as i64;
        if dirty_limit <= self.cleaned_position {
            return 0;
        }
        let cleaned = self.log.clean(self.cleaned_position, dirty_limit);
        self.cleaned_position = dirty_limit;
        cleaned
    }

    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            correlation_id: self.correlation_id,
            canonical: self.canonical.clone(),
            session_id: self.session_id,
            stream_id: self.stream_id,
            log: Arc::clone(&self.log),
            activity: Arc::clone(&self.activity),
            hwm_position: self.hwm_position.clone(),
            control_address: self.control_address,
            source_address: self.source_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{HeapLogFactory, LogFactory, LogIdentity};
    use crate::counters::CountersManager;

    const TERM: usize = 64 * 1024;

    fn connection(counters: &mut CountersManager, subscribers: usize) -> NetworkConnection {
        let canonical = "UDP-00000000-0-7f000001-40123".to_owned();
        let log = HeapLogFactory::new(TERM)
            .new_connection(
                LogIdentity {
                    canonical_channel: &canonical,
                    session_id: SessionId(1),
                    stream_id: StreamId(10),
                    correlation_id: CorrelationId(50),
                },
                0,
                TERM,
                4096,
            )
            .unwrap();
        let subscriber_positions = (0..subscribers)
            .map(|i| {
                (
                    CorrelationId(i as i64 + 1),
                    counters.new_position("subscriber pos").unwrap(),
                )
            })
            .collect();
        NetworkConnection::new(
            ConnectionParams {
                correlation_id: CorrelationId(50),
                canonical,
                channel_uri: "udp://127.0.0.1:40123".into(),
                session_id: SessionId(1),
                stream_id: StreamId(10),
                log,
                hwm_position: counters.new_position("receiver hwm").unwrap(),
                subscriber_positions,
                joining_position: 0,
                control_address: Endpoint::localhost(40124),
                source_address: Endpoint::localhost(50000),
            },
            NanoTime::new(0),
        )
    }

    #[test]
    fn drained_needs_end_of_stream_and_caught_up_subscribers() {
        let mut counters = CountersManager::new(8);
        let conn = connection(&mut counters, 2);
        conn.activity().set_rebuild_position(256);
        assert!(!conn.is_drained());

        conn.activity().mark_end_of_stream();
        assert!(!conn.is_drained());

        for info in conn.subscriber_position_infos() {
            counters.reader().position(info.counter_id).unwrap().set_ordered(256);
        }
        assert!(conn.is_drained());
    }

    #[test]
    fn stall_follows_last_frame() {
        let mut counters = CountersManager::new(8);
        let conn = connection(&mut counters, 1);
        let timeout = NanoDuration::new(1_000);
        assert!(!conn.is_stalled(NanoTime::new(1_000), timeout));
        assert!(conn.is_stalled(NanoTime::new(1_001), timeout));

        conn.activity().record_frame(NanoTime::new(900));
        assert!(!conn.is_stalled(NanoTime::new(1_900), timeout));
    }

    #[test]
    fn track_rebuild_publishes_slowest_subscriber() {
        let mut counters = CountersManager::new(8);
        let mut conn = connection(&mut counters, 2);
        let infos = conn.subscriber_position_infos();
        let reader = counters.reader();
        reader.position(infos[0].counter_id).unwrap().set_ordered(TERM as i64 + 128);
        reader.position(infos[1].counter_id).unwrap().set_ordered(TERM as i64 + 64);

        assert_eq!(conn.track_rebuild(), 64);
        assert_eq!(conn.activity().subscriber_position(), TERM as i64 + 64);
        assert_eq!(conn.track_rebuild(), 0);
    }

    #[test]
    fn subscribers_come_and_go() {
        let mut counters = CountersManager::new(8);
        let mut conn = connection(&mut counters, 1);
        let extra = counters.new_position("subscriber pos").unwrap();
        conn.add_subscriber(CorrelationId(9), extra.clone());
        assert_eq!(conn.subscriber_count(), 2);
        assert_eq!(conn.remove_subscriber(CorrelationId(9)).map(|p| p.id()), Some(extra.id()));
        assert!(conn.remove_subscriber(CorrelationId(9)).is_none());

        let positions = conn.take_positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(conn.subscriber_count(), 0);
    }
}
