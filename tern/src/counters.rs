//! Counters region: labelled `i64` slots shared across threads.
//!
//! The conductor alone allocates and frees slots. Each slot value has a single
//! writer (Sender, Receiver, client or conductor) that stores with release
//! ordering; everyone else reads with plain acquire loads.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use thiserror::Error;

use crate::control::types::{CorrelationId, CounterId, SessionId, StreamId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CountersError {
    #[error("counters exhausted: all {capacity} slots allocated")]
    Exhausted { capacity: usize },
    #[error("counter {0} is not allocated")]
    NotAllocated(CounterId),
}

/// Formats the label of a stream position counter.
///
/// `<kind>: <channel> <session> <stream> <correlation>`, ids in hex.
#[must_use]
pub fn position_label(
    kind: &str,
    channel: &str,
    session_id: SessionId,
    stream_id: StreamId,
    correlation_id: CorrelationId,
) -> String {
    format!(
        "{kind}: {channel} {:x} {:x} {:x}",
        session_id.0, stream_id.0, correlation_id.0
    )
}

struct Values(Box<[AtomicI64]>);

impl Values {
    fn slot(&self, id: CounterId) -> Option<&AtomicI64> {
        usize::try_from(id.0).ok().and_then(|i| self.0.get(i))
    }
}

/// Owner of the counters region. Lives on the conductor thread.
pub struct CountersManager {
    values: Arc<Values>,
    labels: Vec<Option<String>>,
    free_ids: Vec<CounterId>,
    next_unused: usize,
}

impl CountersManager {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Arc::new(Values((0..capacity).map(|_| AtomicI64::new(0)).collect())),
            labels: vec![None; capacity],
            free_ids: Vec::new(),
            next_unused: 0,
        }
    }

    /// Allocates a zeroed slot, reusing freed ids first.
    ///
    /// # Errors
    ///
    /// [`CountersError::Exhausted`] when every slot is in use.
    pub fn allocate(&mut self, label: impl Into<String>) -> Result<CounterId, CountersError> {
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None if self.next_unused < self.labels.len() => {
                let id = CounterId(i32::try_from(self.next_unused).map_err(|_| {
                    CountersError::Exhausted {
                        capacity: self.labels.len(),
                    }
                })?);
                self.next_unused += 1;
                id
            }
            None => {
                return Err(CountersError::Exhausted {
                    capacity: self.labels.len(),
                });
            }
        };
        if let Some(value) = self.values.slot(id) {
            value.store(0, Ordering::Release);
        }
        self.labels[id.0 as usize] = Some(label.into());
        Ok(id)
    }

    /// Allocates a slot and wraps it in a [`Position`].
    ///
    /// # Errors
    ///
    /// See [`CountersManager::allocate`].
    pub fn new_position(&mut self, label: impl Into<String>) -> Result<Position, CountersError> {
        let id = self.allocate(label)?;
        Ok(Position {
            values: Arc::clone(&self.values),
            id,
        })
    }

    /// Returns a slot to the pool.
    ///
    /// # Errors
    ///
    /// [`CountersError::NotAllocated`] for an id that is free or out of range.
    pub fn free(&mut self, id: CounterId) -> Result<(), CountersError> {
        let label = usize::try_from(id.0)
            .ok()
            .and_then(|i| self.labels.get_mut(i))
            .ok_or(CountersError::NotAllocated(id))?;
        if label.take().is_none() {
            return Err(CountersError::NotAllocated(id));
        }
        self.free_ids.push(id);
        Ok(())
    }

    #[must_use]
    pub fn label(&self, id: CounterId) -> Option<&str> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.labels.get(i))
            .and_then(Option::as_deref)
    }

    /// Number of slots currently allocated.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_some()).count()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.labels.len()
    }

    /// Read access to every slot value, for other threads and clients.
    #[must_use]
    pub fn reader(&self) -> CountersReader {
        CountersReader {
            values: Arc::clone(&self.values),
        }
    }
}

/// Shared read view of the counter values.
#[derive(Clone)]
pub struct CountersReader {
    values: Arc<Values>,
}

impl CountersReader {
    /// Current value, `None` for an out-of-range id.
    #[must_use]
    pub fn get(&self, id: CounterId) -> Option<i64> {
        self.values.slot(id).map(|v| v.load(Ordering::Acquire))
    }

    /// A handle onto slot `id` for its single writer. `None` if out of range.
    #[must_use]
    pub fn position(&self, id: CounterId) -> Option<Position> {
        self.values.slot(id)?;
        Some(Position {
            values: Arc::clone(&self.values),
            id,
        })
    }
}

/// Handle on one counter slot used as a stream position.
#[derive(Clone)]
pub struct Position {
    values: Arc<Values>,
    id: CounterId,
}

impl Position {
    #[must_use]
    pub const fn id(&self) -> CounterId {
        self.id
    }

    fn cell(&self) -> &AtomicI64 {
        // Positions are only built for in-range ids.
        &self.values.0[self.id.0 as usize]
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.cell().load(Ordering::Acquire)
    }

    /// Release store; only the position's owner calls this.
    pub fn set_ordered(&self, value: i64) {
        self.cell().store(value, Ordering::Release);
    }

    /// Atomic add, for counters bumped from more than one thread.
    pub fn increment(&self) {
        self.cell().fetch_add(1, Ordering::AcqRel);
    }

    /// Stores `value` if it is greater than the current one. Single-writer only.
    pub fn propose_max_ordered(&self, value: i64) -> bool {
        if value > self.cell().load(Ordering::Relaxed) {
            self.set_ordered(value);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Position")
            .field("id", &self.id)
            .field("value", &self.get())
            .finish()
    }
}

/// Driver-wide counters, allocated once when the conductor starts.
pub struct SystemCounters {
    pub client_keepalives: Position,
    pub errors: Position,
    pub publications_created: Position,
    pub connections_created: Position,
    pub endpoint_close_timeouts: Position,
    pub frames_dropped_by_loss: Position,
    pub retransmits_sent: Position,
    pub events_dropped: Position,
    /// Failed offers to a full Sender command queue.
    pub sender_proxy_fails: Position,
    /// Failed offers to a full Receiver command queue.
    pub receiver_proxy_fails: Position,
    pub client_responses_dropped: Position,
}

impl SystemCounters {
    /// # Errors
    ///
    /// Fails if the region cannot hold the system counters.
    pub fn allocate(counters: &mut CountersManager) -> Result<Self, CountersError> {
        Ok(Self {
            client_keepalives: counters.new_position("client keepalives")?,
            errors: counters.new_position("errors")?,
            publications_created: counters.new_position("publications created")?,
            connections_created: counters.new_position("connections created")?,
            endpoint_close_timeouts: counters.new_position("endpoint close timeouts")?,
            frames_dropped_by_loss: counters.new_position("frames dropped by loss")?,
            retransmits_sent: counters.new_position("retransmits sent")?,
            events_dropped: counters.new_position("events dropped")?,
            sender_proxy_fails: counters.new_position("failed offers to sender proxy")?,
            receiver_proxy_fails: counters.new_position("failed offers to receiver proxy")?,
            client_responses_dropped: counters.new_position("client responses dropped")?,
        })
    }

    /// Number of slots [`SystemCounters::allocate`] takes.
    pub const COUNT: usize = 11;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_free_reuses_ids() {
        let mut counters = CountersManager::new(2);
        let a = counters.allocate("a").unwrap();
        let b = counters.allocate("b").unwrap();
        assert_eq!(
            counters.allocate("c"),
            Err(CountersError::Exhausted { capacity: 2 })
        );
        counters.free(a).unwrap();
        assert_eq!(counters.allocated_count(), 1);
        let c = counters.allocate("c").unwrap();
        assert_eq!(c, a);
        assert_eq!(counters.label(c), Some("c"));
        assert_eq!(counters.label(b), Some("b"));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut counters = CountersManager::new(1);
        let id = counters.allocate("x").unwrap();
        counters.free(id).unwrap();
        assert_eq!(counters.free(id), Err(CountersError::NotAllocated(id)));
        assert_eq!(
            counters.free(CounterId(9)),
            Err(CountersError::NotAllocated(CounterId(9)))
        );
    }

    #[test]
    fn reallocated_slot_starts_at_zero() {
        let mut counters = CountersManager::new(1);
        let pos = counters.new_position("p").unwrap();
        pos.set_ordered(77);
        counters.free(pos.id()).unwrap();
        let again = counters.new_position("p").unwrap();
        assert_eq!(again.get(), 0);
    }

    #[test]
    fn reader_sees_writer() {
        let mut counters = CountersManager::new(4);
        let pos = counters.new_position("sender pos").unwrap();
        let reader = counters.reader();
        pos.set_ordered(1024);
        assert_eq!(reader.get(pos.id()), Some(1024));
        assert!(!pos.propose_max_ordered(10));
        assert!(pos.propose_max_ordered(2048));
        assert_eq!(reader.position(pos.id()).map(|p| p.get()), Some(2048));
        assert_eq!(reader.get(CounterId(-1)), None);
    }

    #[test]
    fn label_format() {
        let label = position_label(
            "sender pos",
            "udp://localhost:40123",
            SessionId(42),
            StreamId(7),
            CorrelationId(100),
        );
        assert_eq!(label, "sender pos: udp://localhost:40123 2a 7 64");
    }

    #[test]
    fn system_counters_fit() {
        let mut counters = CountersManager::new(SystemCounters::COUNT);
        let system = SystemCounters::allocate(&mut counters).unwrap();
        system.errors.increment();
        system.errors.increment();
        assert_eq!(system.errors.get(), 2);
        assert_eq!(counters.allocated_count(), SystemCounters::COUNT);
    }
}
