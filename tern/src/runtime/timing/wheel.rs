//! Hashed timing wheel with O(1) schedule/cancel.
//!
//! Single level, power-of-two slot count. A timer whose deadline is more than
//! one rotation away simply stays in its slot list and is skipped until due.
//! A single `expire` call never visits more than one full rotation, so a long
//! stall costs at most `slots` slot visits.

use core::num::NonZeroUsize;

use thiserror::Error;

use super::slab::{Slab, SlabIndex};
use super::tick::{TickInstant, TickSpan};
use super::time::{NanoDuration, NanoTime};

/// Identifies a scheduled timer; goes stale once the timer fires or is cancelled.
pub struct TimerHandle<T> {
    idx: SlabIndex<T>,
    generation: u32,
}

impl<T> Copy for TimerHandle<T> {}

impl<T> Clone for TimerHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for TimerHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx && self.generation == other.generation
    }
}

impl<T> Eq for TimerHandle<T> {}

impl<T> core::fmt::Debug for TimerHandle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("idx", &self.idx)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Witness for a power-of-two slot count.
#[derive(Clone, Copy, Debug)]
pub struct PowerOfTwo(usize);

impl PowerOfTwo {
    #[must_use]
    pub const fn new(val: usize) -> Option<Self> {
        if val.is_power_of_two() {
            Some(Self(val))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Wheel geometry, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct WheelConfig {
    pub slots: PowerOfTwo,
    pub tick: NanoDuration,
    pub capacity: NonZeroUsize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("tick length must be non-zero")]
    ZeroTick,
    #[error("timer capacity {0} exceeds u32 indices")]
    CapacityTooLarge(usize),
    #[error("timer capacity exhausted")]
    Full,
}

/// Hashed timing wheel keyed on nanosecond deadlines.
pub struct Wheel<T> {
    slots: Vec<Option<SlabIndex<T>>>,
    slab: Slab<T>,
    mask: u64,
    tick_ns: u64,
    cursor: TickInstant,
}

impl<T> Wheel<T> {
    /// Creates a wheel whose cursor starts at `start`.
    ///
    /// # Errors
    ///
    /// Fails on a zero tick or a capacity that does not fit `u32` indices.
    pub fn new(cfg: WheelConfig, start: NanoTime) -> Result<Self, WheelError> {
        if cfg.tick.is_zero() {
            return Err(WheelError::ZeroTick);
        }
        let slab = Slab::with_capacity(cfg.capacity)
            .ok_or(WheelError::CapacityTooLarge(cfg.capacity.get()))?;
        let tick_ns = cfg.tick.as_u64();
        Ok(Self {
            slots: vec![None; cfg.slots.get()],
            slab,
            mask: cfg.slots.get() as u64 - 1,
            tick_ns,
            cursor: TickInstant::new(start.as_u64() / tick_ns),
        })
    }

    #[inline]
    fn slot_of(&self, tick: TickInstant) -> usize {
        (tick.get() & self.mask) as usize
    }

    /// Schedules `payload` to fire once `expire` is called with `now >= deadline`
    /// (rounded up to the next tick boundary).
    ///
    /// # Errors
    ///
    /// Returns the payload when the timer capacity is exhausted.
    pub fn schedule_at(&mut self, deadline: NanoTime, payload: T) -> Result<TimerHandle<T>, T> {
        let ticks = deadline.as_u64().div_ceil(self.tick_ns);
        let next = self.cursor + TickSpan::new(1);
        let deadline = TickInstant::new(ticks).max(next);

        let slot = self.slot_of(deadline);
        let head = self.slots[slot];
        let (idx, generation) = self.slab.alloc(payload, deadline)?;
        if let Some(node) = self.slab.get_mut(idx) {
            node.next = head;
        }
        if let Some(head_idx) = head
            && let Some(head) = self.slab.get_mut(head_idx)
        {
            head.prev = Some(idx);
        }
        self.slots[slot] = Some(idx);
        Ok(TimerHandle { idx, generation })
    }

    /// Schedules relative to `now`.
    ///
    /// # Errors
    ///
    /// Returns the payload when the timer capacity is exhausted.
    pub fn schedule_after(
        &mut self,
        now: NanoTime,
        delay: NanoDuration,
        payload: T,
    ) -> Result<TimerHandle<T>, T> {
        self.schedule_at(now + delay, payload)
    }

    /// Cancels a pending timer and returns its payload; `None` for stale handles.
    pub fn cancel(&mut self, handle: TimerHandle<T>) -> Option<T> {
        let node = self.slab.get(handle.idx)?;
        if node.generation != handle.generation {
            return None;
        }
        let (prev, next, deadline) = (node.prev, node.next, node.deadline);
        self.unlink(prev, next, deadline);
        self.slab.free(handle.idx).map(|n| n.payload)
    }

    fn unlink(
        &mut self,
        prev: Option<SlabIndex<T>>,
        next: Option<SlabIndex<T>>,
        deadline: TickInstant,
    ) {
        match prev {
            Some(p) => {
                if let Some(pnode) = self.slab.get_mut(p) {
                    pnode.next = next;
                }
            }
            None => {
                let slot = self.slot_of(deadline);
                self.slots[slot] = next;
            }
        }
        if let Some(n) = next
            && let Some(nnode) = self.slab.get_mut(n)
        {
            nnode.prev = prev;
        }
    }

    /// Advances to `now`, handing each due timer's payload to `on_fire`.
    ///
    /// Returns the number of timers fired.
    pub fn expire(&mut self, now: NanoTime, mut on_fire: impl FnMut(TimerHandle<T>, T)) -> usize {
        let now_tick = TickInstant::new(now.as_u64() / self.tick_ns);
        let behind = now_tick.span_since(self.cursor).get();
        if behind == 0 {
            return 0;
        }
        let visits = behind.min(self.slots.len() as u64);
        let mut fired = 0;
        for step in 1..=visits {
            let slot = self.slot_of(self.cursor + TickSpan::new(step));
            let mut cursor = self.slots[slot];
            while let Some(idx) = cursor {
                let Some(node) = self.slab.get(idx) else { break };
                cursor = node.next;
                if node.deadline > now_tick {
                    continue;
                }
                let (prev, next, deadline, generation) =
                    (node.prev, node.next, node.deadline, node.generation);
                self.unlink(prev, next, deadline);
                if let Some(node) = self.slab.free(idx) {
                    on_fire(TimerHandle { idx, generation }, node.payload);
                    fired += 1;
                }
            }
        }
        self.cursor = now_tick;
        fired
    }

    /// Number of pending timers.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.slab.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.slab.len() == 0
    }

    /// Earliest pending deadline, rounded to its tick. Walks every pending timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<NanoTime> {
        self.slots
            .iter()
            .flat_map(|head| {
                let mut cursor = *head;
                std::iter::from_fn(move || {
                    let node = self.slab.get(cursor?)?;
                    cursor = node.next;
                    Some(node.deadline)
                })
            })
            .min()
            .map(|tick| NanoTime::new(tick.get().saturating_mul(self.tick_ns)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wheel(slots: usize, capacity: usize) -> Wheel<u32> {
        Wheel::new(
            WheelConfig {
                slots: PowerOfTwo::new(slots).unwrap(),
                tick: NanoDuration::new(10),
                capacity: NonZeroUsize::new(capacity).unwrap(),
            },
            NanoTime::ZERO,
        )
        .unwrap()
    }

    fn fire(w: &mut Wheel<u32>, now: u64) -> Vec<u32> {
        let mut fired = Vec::new();
        w.expire(NanoTime::new(now), |_, v| fired.push(v));
        fired.sort_unstable();
        fired
    }

    #[test]
    fn fires_only_when_due() {
        let mut w = wheel(8, 4);
        w.schedule_at(NanoTime::new(25), 1).unwrap();
        w.schedule_at(NanoTime::new(40), 2).unwrap();
        assert!(fire(&mut w, 20).is_empty());
        assert_eq!(fire(&mut w, 30), vec![1]);
        assert_eq!(fire(&mut w, 40), vec![2]);
        assert!(w.is_empty());
    }

    #[test]
    fn past_deadline_fires_next_tick() {
        let mut w = wheel(8, 2);
        w.expire(NanoTime::new(100), |_, _| {});
        w.schedule_at(NanoTime::new(5), 7).unwrap();
        assert!(fire(&mut w, 105).is_empty());
        assert_eq!(fire(&mut w, 110), vec![7]);
    }

    #[test]
    fn cancel_returns_payload_and_stales_handle() {
        let mut w = wheel(8, 2);
        let h = w.schedule_at(NanoTime::new(30), 42).unwrap();
        assert_eq!(w.cancel(h), Some(42));
        assert_eq!(w.cancel(h), None);
        assert!(fire(&mut w, 100).is_empty());
    }

    #[test]
    fn cancel_middle_of_slot_list() {
        let mut w = wheel(4, 4);
        w.schedule_at(NanoTime::new(30), 1).unwrap();
        let mid = w.schedule_at(NanoTime::new(30), 2).unwrap();
        w.schedule_at(NanoTime::new(30), 3).unwrap();
        assert_eq!(w.cancel(mid), Some(2));
        assert_eq!(fire(&mut w, 30), vec![1, 3]);
    }

    #[test]
    fn capacity_exhaustion_returns_payload() {
        let mut w = wheel(8, 1);
        w.schedule_at(NanoTime::new(10), 1).unwrap();
        assert_eq!(w.schedule_at(NanoTime::new(10), 2), Err(2));
    }

    #[test]
    fn far_deadline_survives_rotations() {
        let mut w = wheel(4, 2);
        // 4 slots * 10ns = 40ns per rotation.
        w.schedule_at(NanoTime::new(130), 9).unwrap();
        for now in (10..130).step_by(10) {
            assert!(fire(&mut w, now).is_empty(), "fired early at {now}");
        }
        assert_eq!(fire(&mut w, 130), vec![9]);
    }

    #[test]
    fn large_jump_fires_everything_due() {
        let mut w = wheel(4, 8);
        for (i, at) in [10u64, 20, 30, 70, 500].into_iter().enumerate() {
            w.schedule_at(NanoTime::new(at), i as u32).unwrap();
        }
        assert_eq!(fire(&mut w, 1_000), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn next_deadline_reports_minimum() {
        let mut w = wheel(8, 4);
        assert_eq!(w.next_deadline(), None);
        w.schedule_at(NanoTime::new(90), 1).unwrap();
        w.schedule_at(NanoTime::new(31), 2).unwrap();
        assert_eq!(w.next_deadline(), Some(NanoTime::new(40)));
    }
}
