//! NAK-driven retransmit scheduling for one publication.
//!
//! A NAK for `(term_id, term_offset)` schedules a resend after `delay`. While
//! that resend is pending, or lingering afterwards, further NAKs for the same
//! range are ignored so a burst of receivers asking for the same gap produces
//! one retransmission.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::num::NonZeroUsize;

use crate::runtime::timing::{
    NanoDuration, NanoTime, PowerOfTwo, Wheel, WheelConfig, WheelError,
};
use crate::trace::{trace, warn};

const WHEEL_SLOTS: PowerOfTwo = match PowerOfTwo::new(256) {
    Some(slots) => slots,
    None => panic!("wheel slots must be a power of two"),
};
const MAX_ACTIONS: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => panic!("action capacity must be non-zero"),
};

type RangeKey = (i32, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Delayed,
    Lingering,
}

struct Action {
    length: usize,
    state: State,
}

/// Per-publication retransmit scheduler, owned by the Sender.
pub struct RetransmitHandler {
    wheel: Wheel<RangeKey>,
    actions: HashMap<RangeKey, Action>,
    delay: NanoDuration,
    linger: NanoDuration,
}

impl RetransmitHandler {
    /// # Errors
    /// Fails if the tick is zero.
    pub fn new(
        now: NanoTime,
        tick: NanoDuration,
        delay: NanoDuration,
        linger: NanoDuration,
    ) -> Result<Self, WheelError> {
        let cfg = WheelConfig {
            slots: WHEEL_SLOTS,
            tick,
            capacity: MAX_ACTIONS,
        };
        Ok(Self {
            wheel: Wheel::new(cfg, now)?,
            actions: HashMap::new(),
            delay,
            linger,
        })
    }

    /// Handles a NAK. With no delay the resend happens immediately.
    ///
    /// Returns `false` if the range already has an action in flight.
    pub fn on_nak(
        &mut self,
        now: NanoTime,
        term_id: i32,
        term_offset: i32,
        length: usize,
        mut resend: impl FnMut(i32, i32, usize),
    ) -> bool {
        let key = (term_id, term_offset);
        let Entry::Vacant(slot) = self.actions.entry(key) else {
            trace!(term_id, term_offset, "NAK for range already in flight");
            return false;
        };

        if self.delay.is_zero() {
            resend(term_id, term_offset, length);
            slot.insert(Action {
                length,
                state: State::Lingering,
            });
            self.schedule(now + self.linger, key);
        } else {
            slot.insert(Action {
                length,
                state: State::Delayed,
            });
            self.schedule(now + self.delay, key);
        }
        true
    }

    /// Fires due resends and retires lingering actions. Returns timers expired.
    pub fn process_timeouts(
        &mut self,
        now: NanoTime,
        mut resend: impl FnMut(i32, i32, usize),
    ) -> usize {
        let mut due = Vec::new();
        let fired = self.wheel.expire(now, |_, key| due.push(key));

        for key in due {
            let Some(action) = self.actions.get_mut(&key) else {
                continue;
            };
            match action.state {
                State::Delayed => {
                    resend(key.0, key.1, action.length);
                    action.state = State::Lingering;
                    self.schedule(now + self.linger, key);
                }
                State::Lingering => {
                    self.actions.remove(&key);
                }
            }
        }
        fired
    }

    fn schedule(&mut self, deadline: NanoTime, key: RangeKey) {
        if self.wheel.schedule_at(deadline, key).is_err() {
            // Without a timer the action would suppress NAKs forever.
            self.actions.remove(&key);
            warn!(
                term_id = key.0,
                term_offset = key.1,
                "retransmit timers exhausted, dropping action"
            );
        }
    }

    /// Actions currently delayed or lingering.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn handler(delay_ms: u64) -> RetransmitHandler {
        RetransmitHandler::new(
            NanoTime::new(0),
            NanoDuration::from_millis(1),
            NanoDuration::from_millis(delay_ms),
            NanoDuration::from_millis(60),
        )
        .unwrap()
    }

    #[test]
    fn delayed_resend_fires_once_then_lingers() {
        let mut h = handler(20);
        let mut sent = Vec::new();
        assert!(h.on_nak(NanoTime::new(0), 1, 0, 512, |t, o, l| sent.push((t, o, l))));
        assert!(!h.on_nak(NanoTime::new(MS), 1, 0, 512, |t, o, l| sent.push((t, o, l))));
        assert!(sent.is_empty());

        h.process_timeouts(NanoTime::new(10 * MS), |t, o, l| sent.push((t, o, l)));
        assert!(sent.is_empty());
        h.process_timeouts(NanoTime::new(20 * MS), |t, o, l| sent.push((t, o, l)));
        assert_eq!(sent, vec![(1, 0, 512)]);

        // Lingering: repeat NAKs are still suppressed.
        assert!(!h.on_nak(NanoTime::new(30 * MS), 1, 0, 512, |_, _, _| {}));
        h.process_timeouts(NanoTime::new(80 * MS), |_, _, _| panic!("no second resend"));
        assert_eq!(h.pending(), 0);
        assert!(h.on_nak(NanoTime::new(81 * MS), 1, 0, 512, |_, _, _| {}));
    }

    #[test]
    fn zero_delay_resends_immediately() {
        let mut h = handler(0);
        let mut sent = 0;
        assert!(h.on_nak(NanoTime::new(0), 2, 64, 128, |_, _, _| sent += 1));
        assert_eq!(sent, 1);
        assert_eq!(h.pending(), 1);
        h.process_timeouts(NanoTime::new(60 * MS), |_, _, _| sent += 1);
        assert_eq!(sent, 1);
        assert_eq!(h.pending(), 0);
    }

    #[test]
    fn distinct_ranges_are_independent() {
        let mut h = handler(5);
        assert!(h.on_nak(NanoTime::new(0), 1, 0, 32, |_, _, _| {}));
        assert!(h.on_nak(NanoTime::new(0), 1, 32, 32, |_, _, _| {}));
        let mut sent = Vec::new();
        h.process_timeouts(NanoTime::new(5 * MS), |t, o, _| sent.push((t, o)));
        sent.sort_unstable();
        assert_eq!(sent, vec![(1, 0), (1, 32)]);
    }
}
