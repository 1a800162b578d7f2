//! Send-side stream instances and the links clients hold on them.

use std::sync::Arc;

use crate::buffer::RawLog;
use crate::control::types::{ClientId, CorrelationId, SessionId, StreamId};
use crate::counters::Position;
use crate::net::Endpoint;
use crate::runtime::timing::{NanoDuration, NanoTime};

/// Identity of a publication: one per (channel, session, stream).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicationKey {
    pub canonical: String,
    pub session_id: SessionId,
    pub stream_id: StreamId,
}

/// What the Sender needs to drive a publication.
#[derive(Debug, Clone)]
pub struct PublicationHandle {
    pub key: PublicationKey,
    pub destination: Endpoint,
    pub initial_term_id: i32,
    pub log: Arc<RawLog>,
    /// Written by the Sender.
    pub sender_position: Position,
    /// Written by the conductor, read by publishers.
    pub publisher_limit: Position,
}

/// A send-side stream bound to a log and shared by every link on it.
#[derive(Debug)]
pub struct NetworkPublication {
    key: PublicationKey,
    channel_uri: String,
    destination: Endpoint,
    initial_term_id: i32,
    log: Arc<RawLog>,
    sender_position: Position,
    publisher_limit: Position,
    term_window: i64,
    cleaned_position: i64,
    ref_count: usize,
    time_of_flush: Option<NanoTime>,
}

impl NetworkPublication {
    #[must_use]
    pub fn new(
        key: PublicationKey,
        channel_uri: String,
        destination: Endpoint,
        initial_term_id: i32,
        log: Arc<RawLog>,
        sender_position: Position,
        publisher_limit: Position,
    ) -> Self {
        let term_window = (log.term_length() / 2) as i64;
        Self {
            key,
            channel_uri,
            destination,
            initial_term_id,
            log,
            sender_position,
            publisher_limit,
            term_window,
            cleaned_position: 0,
            ref_count: 0,
            time_of_flush: None,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &PublicationKey {
        &self.key
    }

    #[must_use]
    pub fn channel_uri(&self) -> &str {
        &self.channel_uri
    }

    #[must_use]
    pub const fn log(&self) -> &Arc<RawLog> {
        &self.log
    }

    #[must_use]
    pub const fn sender_position(&self) -> &Position {
        &self.sender_position
    }

    #[must_use]
    pub const fn publisher_limit(&self) -> &Position {
        &self.publisher_limit
    }

    #[must_use]
    pub const fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub const fn inc_ref(&mut self) -> usize {
        self.ref_count += 1;
        self.time_of_flush = None;
        self.ref_count
    }

    pub const fn dec_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    #[must_use]
    pub const fn time_of_flush(&self) -> Option<NanoTime> {
        self.time_of_flush
    }

    /// `true` once nothing links to the publication and the Sender has sent
    /// everything publishers wrote. The first call to see this records the
    /// flush time.
    pub fn is_unreferenced_and_flushed(&mut self, now: NanoTime) -> bool {
        if self.ref_count > 0 || self.sender_position.get() < self.log.tail_position() {
            return false;
        }
        self.time_of_flush.get_or_insert(now);
        true
    }

    /// Flushed and lingered for longer than `linger`.
    pub fn is_ready_for_removal(&mut self, now: NanoTime, linger: NanoDuration) -> bool {
        self.is_unreferenced_and_flushed(now)
            && self
                .time_of_flush
                .is_some_and(|flushed| now > flushed + linger)
    }

    /// Moves the publisher limit to half a term past the sender. Returns 1 if it moved.
    pub fn update_publisher_limit(&self) -> usize {
        let candidate = self.sender_position.get() + self.term_window;
        usize::from(self.publisher_limit.propose_max_ordered(candidate))
    }

    /// Zeroes log bytes more than a term behind the sender so the partition
    /// can be rewritten. Returns bytes cleaned.
    pub fn clean_log_buffer(&mut self) -> usize {
        let dirty_limit = self.sender_position.get() - self.log.term_length() as i64;
        if dirty_limit <= self.cleaned_position {
            return 0;
        }
        let cleaned = self.log.clean(self.cleaned_position, dirty_limit);
        self.cleaned_position = dirty_limit;
        cleaned
    }

    #[must_use]
    pub fn handle(&self) -> PublicationHandle {
        PublicationHandle {
            key: self.key.clone(),
            destination: self.destination,
            initial_term_id: self.initial_term_id,
            log: Arc::clone(&self.log),
            sender_position: self.sender_position.clone(),
            publisher_limit: self.publisher_limit.clone(),
        }
    }
}

/// A client's registration on a publication.
#[derive(Debug, Clone)]
pub struct PublicationLink {
    pub registration_id: CorrelationId,
    pub client_id: ClientId,
    pub publication: PublicationKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{HeapLogFactory, LogFactory, LogIdentity};
    use crate::counters::CountersManager;

    const TERM: usize = 64 * 1024;

    fn publication(counters: &mut CountersManager) -> NetworkPublication {
        let key = PublicationKey {
            canonical: "UDP-00000000-0-7f000001-40123".into(),
            session_id: SessionId(42),
            stream_id: StreamId(7),
        };
        let log = HeapLogFactory::new(TERM)
            .new_publication(
                LogIdentity {
                    canonical_channel: &key.canonical,
                    session_id: key.session_id,
                    stream_id: key.stream_id,
                    correlation_id: CorrelationId(100),
                },
                5,
                4096,
            )
            .unwrap();
        NetworkPublication::new(
            key,
            "udp://127.0.0.1:40123".into(),
            Endpoint::localhost(40123),
            5,
            log,
            counters.new_position("sender pos").unwrap(),
            counters.new_position("publisher limit").unwrap(),
        )
    }

    #[test]
    fn flush_requires_no_references_and_sent_data() {
        let mut counters = CountersManager::new(8);
        let mut p = publication(&mut counters);
        let t0 = NanoTime::new(1_000);

        p.inc_ref();
        assert!(!p.is_unreferenced_and_flushed(t0));
        p.dec_ref();

        p.log().set_tail_position(512);
        assert!(!p.is_unreferenced_and_flushed(t0));
        assert_eq!(p.time_of_flush(), None);

        p.sender_position().set_ordered(512);
        assert!(p.is_unreferenced_and_flushed(t0));
        assert!(p.is_unreferenced_and_flushed(NanoTime::new(2_000)));
        assert_eq!(p.time_of_flush(), Some(t0));
    }

    #[test]
    fn removal_waits_for_linger() {
        let mut counters = CountersManager::new(8);
        let mut p = publication(&mut counters);
        let linger = NanoDuration::new(100);
        assert!(!p.is_ready_for_removal(NanoTime::new(1_000), linger));
        assert!(!p.is_ready_for_removal(NanoTime::new(1_100), linger));
        assert!(p.is_ready_for_removal(NanoTime::new(1_101), linger));
    }

    #[test]
    fn re_reference_resets_flush() {
        let mut counters = CountersManager::new(8);
        let mut p = publication(&mut counters);
        assert!(p.is_unreferenced_and_flushed(NanoTime::new(1)));
        p.inc_ref();
        assert_eq!(p.time_of_flush(), None);
    }

    #[test]
    fn publisher_limit_tracks_sender() {
        let mut counters = CountersManager::new(8);
        let p = publication(&mut counters);
        assert_eq!(p.update_publisher_limit(), 1);
        assert_eq!(p.publisher_limit().get(), (TERM / 2) as i64);
        assert_eq!(p.update_publisher_limit(), 0);

        p.sender_position().set_ordered(1024);
        assert_eq!(p.update_publisher_limit(), 1);
        assert_eq!(p.publisher_limit().get(), 1024 + (TERM / 2) as i64);
    }

    #[test]
    fn cleans_a_term_behind_sender() {
        let mut counters = CountersManager::new(8);
        let mut p = publication(&mut counters);
        p.log().write(0, &[1, 2, 3, 4]).unwrap();

        p.sender_position().set_ordered(TERM as i64);
        assert_eq!(p.clean_log_buffer(), 0);

        p.sender_position().set_ordered(TERM as i64 + 64);
        assert_eq!(p.clean_log_buffer(), 64);
        assert_eq!(p.log().read(0, 4).unwrap(), vec![0, 0, 0, 0]);
        assert_eq!(p.clean_log_buffer(), 0);
    }
}
