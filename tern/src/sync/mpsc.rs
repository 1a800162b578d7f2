//! Heap-backed bounded MPSC queue.
//!
//! Vyukov's bounded queue specialised for one consumer. Each slot carries a
//! sequence number:
//!
//! - initially the slot index;
//! - `pos + 1` once a producer has written position `pos`;
//! - `pos + N` once the consumer has released it for the next lap.
//!
//! Producers claim positions with a CAS on `head`; the consumer alone moves
//! `tail`. [`Producer`] is `Clone`, one per client thread.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

#[repr(align(64))]
struct Cursor(AtomicUsize);

struct Shared<T, const N: usize> {
    head: Cursor,
    tail: Cursor,
    slots: Box<[Slot<T>]>,
}

impl<T, const N: usize> Drop for Shared<T, N> {
    fn drop(&mut self) {
        let mut tail = *self.tail.0.get_mut();
        loop {
            let slot = &mut self.slots[tail % N];
            if *slot.seq.get_mut() != tail.wrapping_add(1) {
                break;
            }
            // SAFETY: the sequence says a producer finished writing this slot.
            unsafe { slot.value.get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

// SAFETY: slot contents are handed between threads by the per-slot sequence
// protocol; the atomics themselves are Sync.
unsafe impl<T: Send, const N: usize> Sync for Shared<T, N> {}
unsafe impl<T: Send, const N: usize> Send for Shared<T, N> {}

/// Write end; clone it for each producing thread.
pub struct Producer<T: Send, const N: usize> {
    shared: Arc<Shared<T, N>>,
}

impl<T: Send, const N: usize> Clone for Producer<T, N> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The single read end. `Send` but not `Sync`.
pub struct Consumer<T: Send, const N: usize> {
    shared: Arc<Shared<T, N>>,
    _unsync: PhantomData<Cell<&'static ()>>,
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "queue capacity must be greater than 0");
}

/// Creates a bounded MPSC queue holding at most `N` items.
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let () = CapacityCheck::<N>::OK;

    let shared = Arc::new(Shared {
        head: Cursor(AtomicUsize::new(0)),
        tail: Cursor(AtomicUsize::new(0)),
        slots: (0..N)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect(),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer {
            shared,
            _unsync: PhantomData,
        },
    )
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Pushes without blocking. Safe to call from many threads at once.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let shared = &*self.shared;
        let mut pos = shared.head.0.load(Ordering::Relaxed);
        loop {
            let slot = &shared.slots[pos % N];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match shared.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave this producer exclusive use of
                        // the slot for position `pos`.
                        unsafe { (*slot.value.get()).write(item) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(item);
            } else {
                pos = shared.head.0.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Pops without blocking; `None` when nothing is ready.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let shared = &*self.shared;
        let tail = shared.tail.0.load(Ordering::Relaxed);
        let slot = &shared.slots[tail % N];
        if slot.seq.load(Ordering::Acquire) != tail.wrapping_add(1) {
            return None;
        }
        // SAFETY: the sequence check shows the producer finished its write.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq.store(tail.wrapping_add(N), Ordering::Release);
        shared.tail.0.store(tail.wrapping_add(1), Ordering::Relaxed);
        Some(item)
    }

    /// Pops up to `limit` items into `handler`, returning how many were handled.
    pub fn drain(&self, limit: usize, mut handler: impl FnMut(T)) -> usize {
        let mut count = 0;
        while count < limit {
            let Some(item) = self.pop() else { break };
            handler(item);
            count += 1;
        }
        count
    }

    /// A producer feeding this consumer.
    #[must_use]
    pub fn producer(&self) -> Producer<T, N> {
        Producer {
            shared: Arc::clone(&self.shared),
        }
    }
}
