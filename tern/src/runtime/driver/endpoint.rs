//! Channel endpoints and the registry that owns them.
//!
//! One endpoint exists per canonical channel. Send endpoints are shared by the
//! publications multiplexed over them; receive endpoints count subscriptions
//! per stream. The conductor creates endpoints lazily and drops them when
//! nothing references them any more.

use std::collections::hash_map::{self, HashMap};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::control::types::{SessionId, StreamId};
use crate::net::UdpChannel;

/// Canonical channel to endpoint map.
#[derive(Debug)]
pub struct EndpointRegistry<E> {
    endpoints: HashMap<String, E>,
}

impl<E> Default for EndpointRegistry<E> {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
        }
    }
}

impl<E> EndpointRegistry<E> {
    #[must_use]
    pub fn get(&self, canonical: &str) -> Option<&E> {
        self.endpoints.get(canonical)
    }

    #[must_use]
    pub fn get_mut(&mut self, canonical: &str) -> Option<&mut E> {
        self.endpoints.get_mut(canonical)
    }

    #[must_use]
    pub fn contains(&self, canonical: &str) -> bool {
        self.endpoints.contains_key(canonical)
    }

    /// Returns the endpoint for `canonical`, building it with `create` if absent.
    /// The flag is `true` when a new endpoint was created.
    ///
    /// # Errors
    /// Whatever `create` returns; the registry is left unchanged.
    pub fn get_or_try_create<Err>(
        &mut self,
        canonical: &str,
        create: impl FnOnce() -> Result<E, Err>,
    ) -> Result<(&mut E, bool), Err> {
        match self.endpoints.entry(canonical.to_owned()) {
            hash_map::Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            hash_map::Entry::Vacant(entry) => Ok((entry.insert(create()?), true)),
        }
    }

    pub fn remove(&mut self, canonical: &str) -> Option<E> {
        self.endpoints.remove(canonical)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Empties the registry, yielding every endpoint.
    pub fn drain(&mut self) -> impl Iterator<Item = (String, E)> + '_ {
        self.endpoints.drain()
    }
}

/// Send side of a channel: the set of publications sharing its socket.
#[derive(Debug)]
pub struct SendChannelEndpoint {
    channel: UdpChannel,
    publications: HashSet<(SessionId, StreamId)>,
}

impl SendChannelEndpoint {
    #[must_use]
    pub fn new(channel: UdpChannel) -> Self {
        Self {
            channel,
            publications: HashSet::new(),
        }
    }

    #[must_use]
    pub const fn channel(&self) -> &UdpChannel {
        &self.channel
    }

    pub fn add_publication(&mut self, session_id: SessionId, stream_id: StreamId) {
        self.publications.insert((session_id, stream_id));
    }

    pub fn remove_publication(&mut self, session_id: SessionId, stream_id: StreamId) -> bool {
        self.publications.remove(&(session_id, stream_id))
    }

    #[must_use]
    pub fn has_publication(&self, session_id: SessionId, stream_id: StreamId) -> bool {
        self.publications.contains(&(session_id, stream_id))
    }

    #[must_use]
    pub fn publication_count(&self) -> usize {
        self.publications.len()
    }
}

/// Receive side of a channel with per-stream subscription counts.
#[derive(Debug)]
pub struct ReceiveChannelEndpoint {
    channel: UdpChannel,
    stream_refs: HashMap<StreamId, usize>,
    closed: Arc<AtomicBool>,
}

impl ReceiveChannelEndpoint {
    #[must_use]
    pub fn new(channel: UdpChannel) -> Self {
        Self {
            channel,
            stream_refs: HashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub const fn channel(&self) -> &UdpChannel {
        &self.channel
    }

    /// Adds a reference to `stream_id`, returning the new count.
    pub fn inc_ref_to_stream(&mut self, stream_id: StreamId) -> usize {
        let refs = self.stream_refs.entry(stream_id).or_insert(0);
        *refs += 1;
        *refs
    }

    /// Drops a reference to `stream_id`, returning the remaining count.
    /// A stream with no references left is forgotten.
    pub fn dec_ref_to_stream(&mut self, stream_id: StreamId) -> usize {
        let Some(refs) = self.stream_refs.get_mut(&stream_id) else {
            return 0;
        };
        *refs = refs.saturating_sub(1);
        let remaining = *refs;
        if remaining == 0 {
            self.stream_refs.remove(&stream_id);
        }
        remaining
    }

    #[must_use]
    pub fn stream_refs(&self, stream_id: StreamId) -> usize {
        self.stream_refs.get(&stream_id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.stream_refs.len()
    }

    /// Flag the Receiver sets once it has closed this endpoint's socket.
    #[must_use]
    pub fn close_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

/// Yields until `closed` is set or `timeout` passes. Returns whether the close
/// was confirmed.
pub fn await_close(closed: &AtomicBool, timeout: Duration) -> bool {
    let deadline = minstant::Instant::now() + timeout;
    loop {
        if closed.load(Ordering::Acquire) {
            return true;
        }
        if minstant::Instant::now() >= deadline {
            return false;
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn channel() -> UdpChannel {
        UdpChannel::parse("udp://127.0.0.1:40123").unwrap()
    }

    #[test]
    fn registry_creates_once() {
        let mut registry = EndpointRegistry::default();
        let key = channel().canonical_form().to_owned();

        let (_, created) = registry
            .get_or_try_create::<()>(&key, || Ok(SendChannelEndpoint::new(channel())))
            .unwrap();
        assert!(created);
        let (_, created) = registry
            .get_or_try_create::<()>(&key, || panic!("must not rebuild"))
            .unwrap();
        assert!(!created);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failed_create_leaves_registry_empty() {
        let mut registry = EndpointRegistry::<SendChannelEndpoint>::default();
        assert_eq!(registry.get_or_try_create("x", || Err("bad mtu")).err(), Some("bad mtu"));
        assert!(registry.is_empty());
        assert!(!registry.contains("x"));
    }

    #[test]
    fn stream_reference_counting() {
        let mut endpoint = ReceiveChannelEndpoint::new(channel());
        assert_eq!(endpoint.inc_ref_to_stream(StreamId(1)), 1);
        assert_eq!(endpoint.inc_ref_to_stream(StreamId(1)), 2);
        assert_eq!(endpoint.inc_ref_to_stream(StreamId(2)), 1);
        assert_eq!(endpoint.stream_count(), 2);

        assert_eq!(endpoint.dec_ref_to_stream(StreamId(1)), 1);
        assert_eq!(endpoint.dec_ref_to_stream(StreamId(1)), 0);
        assert_eq!(endpoint.stream_refs(StreamId(1)), 0);
        assert_eq!(endpoint.stream_count(), 1);
        assert_eq!(endpoint.dec_ref_to_stream(StreamId(9)), 0);
    }

    #[test]
    fn send_endpoint_tracks_publications() {
        let mut endpoint = SendChannelEndpoint::new(channel());
        endpoint.add_publication(SessionId(1), StreamId(7));
        endpoint.add_publication(SessionId(1), StreamId(7));
        assert_eq!(endpoint.publication_count(), 1);
        assert!(endpoint.has_publication(SessionId(1), StreamId(7)));
        assert!(endpoint.remove_publication(SessionId(1), StreamId(7)));
        assert_eq!(endpoint.publication_count(), 0);
    }

    #[test]
    fn await_close_sees_confirmation() {
        let endpoint = ReceiveChannelEndpoint::new(channel());
        let flag = endpoint.close_flag();
        let confirmer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            flag.store(true, Ordering::Release);
        });
        assert!(await_close(&endpoint.close_flag(), Duration::from_secs(5)));
        confirmer.join().unwrap();
    }

    #[test]
    fn await_close_times_out() {
        let flag = AtomicBool::new(false);
        assert!(!await_close(&flag, Duration::from_millis(2)));
    }
}
