//! Heap-backed SPSC queue.
//!
//! Each side keeps a cached copy of the other side's index and only touches
//! the shared atomic when the cache says the queue looks full (producer) or
//! empty (consumer).
//!
//! ```
//! use tern::sync::spsc;
//!
//! let (tx, rx) = spsc::channel::<u64, 16>();
//! tx.push(7).unwrap();
//! assert_eq!(rx.pop(), Some(7));
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(align(64))]
struct Padded<T>(T);

struct Shared<T, const N: usize> {
    /// Next index to write. Written by the producer only.
    head: Padded<AtomicUsize>,
    /// Next index to read. Written by the consumer only.
    tail: Padded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T, const N: usize> Shared<T, N> {
    fn new() -> Self {
        Self {
            head: Padded(AtomicUsize::new(0)),
            tail: Padded(AtomicUsize::new(0)),
            slots: (0..N)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }
}

impl<T, const N: usize> Drop for Shared<T, N> {
    fn drop(&mut self) {
        let head = *self.head.0.get_mut();
        let mut tail = *self.tail.0.get_mut();
        while tail != head {
            // SAFETY: slots in [tail, head) were written and never read.
            unsafe { self.slots[tail % N].get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

// SAFETY: a slot is only ever accessed by the side that currently owns it,
// and ownership moves through the release/acquire pair on head and tail.
unsafe impl<T: Send, const N: usize> Sync for Shared<T, N> {}
unsafe impl<T: Send, const N: usize> Send for Shared<T, N> {}

/// Opts out of `Sync` while staying `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end. `Send` but not `Sync`: move it to one thread, never share it.
pub struct Producer<T: Send, const N: usize> {
    shared: Arc<Shared<T, N>>,
    cached_tail: Cell<usize>,
    _unsync: PhantomUnsync,
}

/// Read end. Same threading rules as [`Producer`].
pub struct Consumer<T: Send, const N: usize> {
    shared: Arc<Shared<T, N>>,
    cached_head: Cell<usize>,
    _unsync: PhantomUnsync,
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "queue capacity must be greater than 0");
}

/// Creates a bounded SPSC queue holding at most `N` items.
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let () = CapacityCheck::<N>::OK;

    let shared = Arc::new(Shared::new());
    (
        Producer {
            shared: Arc::clone(&shared),
            cached_tail: Cell::new(0),
            _unsync: PhantomData,
        },
        Consumer {
            shared,
            cached_head: Cell::new(0),
            _unsync: PhantomData,
        },
    )
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Pushes without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        let head = self.shared.head.0.load(Ordering::Relaxed);
        if head.wrapping_sub(self.cached_tail.get()) >= N {
            self.cached_tail
                .set(self.shared.tail.0.load(Ordering::Acquire));
            if head.wrapping_sub(self.cached_tail.get()) >= N {
                return Err(item);
            }
        }
        // SAFETY: head - tail < N, so the consumer is not looking at this slot
        // and will not until the release store below.
        unsafe { (*self.shared.slots[head % N].get()).write(item) };
        self.shared
            .head
            .0
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Number of items currently queued (approximate under concurrency).
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.shared.head.0.load(Ordering::Relaxed);
        head.wrapping_sub(self.shared.tail.0.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Pops without waiting; `None` when empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let tail = self.shared.tail.0.load(Ordering::Relaxed);
        if self.cached_head.get() == tail {
            self.cached_head
                .set(self.shared.head.0.load(Ordering::Acquire));
            if self.cached_head.get() == tail {
                return None;
            }
        }
        // SAFETY: tail < head, the producer published this slot and will not
        // reuse it until the release store below.
        let item = unsafe { (*self.shared.slots[tail % N].get()).assume_init_read() };
        self.shared
            .tail
            .0
            .store(tail.wrapping_add(1), Ordering::Release);
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
}
