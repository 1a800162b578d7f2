//! Driver event log.
//!
//! A fire-and-forget diagnostic sink. Any thread may record an event through a
//! cloned [`EventLogger`]; the conductor drains a bounded number per duty cycle.
//! Recording never blocks: when the ring is full the event is dropped and counted.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::timing::{NanoClock, NanoTime};
use crate::sync::mpsc;

/// Capacity of the event ring.
pub const EVENT_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCode {
    CmdInAddPublication,
    CmdInRemovePublication,
    CmdInAddSubscription,
    CmdInRemoveSubscription,
    CmdInKeepalive,
    ChannelCreated,
    RemovePublicationCleanup,
    RemoveSubscriptionCleanup,
    RemoveConnectionCleanup,
    Exception,
    EndpointCloseTimeout,
}

impl EventCode {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CmdInAddPublication => "CMD_IN_ADD_PUBLICATION",
            Self::CmdInRemovePublication => "CMD_IN_REMOVE_PUBLICATION",
            Self::CmdInAddSubscription => "CMD_IN_ADD_SUBSCRIPTION",
            Self::CmdInRemoveSubscription => "CMD_IN_REMOVE_SUBSCRIPTION",
            Self::CmdInKeepalive => "CMD_IN_KEEPALIVE_CLIENT",
            Self::ChannelCreated => "CHANNEL_CREATION",
            Self::RemovePublicationCleanup => "REMOVE_PUBLICATION_CLEANUP",
            Self::RemoveSubscriptionCleanup => "REMOVE_SUBSCRIPTION_CLEANUP",
            Self::RemoveConnectionCleanup => "REMOVE_CONNECTION_CLEANUP",
            Self::Exception => "EXCEPTION",
            Self::EndpointCloseTimeout => "ENDPOINT_CLOSE_TIMEOUT",
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverEvent {
    pub code: EventCode,
    pub timestamp: NanoTime,
    pub detail: String,
}

/// Creates a logger/reader pair sharing one ring.
#[must_use]
pub fn event_log(clock: Arc<dyn NanoClock>) -> (EventLogger, EventReader) {
    let (producer, consumer) = mpsc::channel::<DriverEvent, EVENT_LOG_CAPACITY>();
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventLogger {
            producer,
            clock,
            dropped: Arc::clone(&dropped),
        },
        EventReader { consumer, dropped },
    )
}

/// Write handle; clone freely.
#[derive(Clone)]
pub struct EventLogger {
    producer: mpsc::Producer<DriverEvent, EVENT_LOG_CAPACITY>,
    clock: Arc<dyn NanoClock>,
    dropped: Arc<AtomicU64>,
}

impl EventLogger {
    pub fn log(&self, code: EventCode, detail: impl Into<String>) {
        let event = DriverEvent {
            code,
            timestamp: self.clock.now(),
            detail: detail.into(),
        };
        if self.producer.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Read end, drained by the conductor.
pub struct EventReader {
    consumer: mpsc::Consumer<DriverEvent, EVENT_LOG_CAPACITY>,
    dropped: Arc<AtomicU64>,
}

impl EventReader {
    /// Hands at most `limit` events to `handler`.
    pub fn read(&self, limit: usize, handler: impl FnMut(DriverEvent)) -> usize {
        self.consumer.drain(limit, handler)
    }

    /// Events lost to a full ring since start.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::timing::ManualClock;

    #[test]
    fn events_carry_clock_timestamp() {
        let clock = ManualClock::new(NanoTime::new(5));
        let (logger, reader) = event_log(Arc::new(clock.clone()));
        logger.log(EventCode::ChannelCreated, "UDP-00000000-0-7f000001-40123");
        clock.set(NanoTime::new(9));
        logger.log(EventCode::Exception, String::from("boom"));

        let mut events = Vec::new();
        assert_eq!(reader.read(8, |e| events.push(e)), 2);
        assert_eq!(events[0].timestamp, NanoTime::new(5));
        assert_eq!(events[0].code, EventCode::ChannelCreated);
        assert_eq!(events[1].timestamp, NanoTime::new(9));
        assert_eq!(events[1].detail, "boom");
    }

    #[test]
    fn reader_respects_frame_limit() {
        let (logger, reader) = event_log(Arc::new(ManualClock::default()));
        for _ in 0..10 {
            logger.log(EventCode::CmdInKeepalive, "");
        }
        assert_eq!(reader.read(8, drop), 8);
        assert_eq!(reader.read(8, drop), 2);
    }

    #[test]
    fn full_ring_counts_drops() {
        let (logger, reader) = event_log(Arc::new(ManualClock::default()));
        for _ in 0..EVENT_LOG_CAPACITY + 3 {
            logger.log(EventCode::CmdInKeepalive, "");
        }
        assert_eq!(reader.dropped(), 3);
    }
}
