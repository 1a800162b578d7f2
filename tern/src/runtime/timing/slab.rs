//! Generational slab holding the wheel's intrusive timer nodes.

use core::marker::PhantomData;
use core::num::NonZeroUsize;

use super::tick::TickInstant;

/// Index into a [`Slab`]. Typed by payload so indices cannot cross slabs.
pub struct SlabIndex<T>(u32, PhantomData<T>);

// Manual impls: derive would require bounds on T.
impl<T> Copy for SlabIndex<T> {}

impl<T> Clone for SlabIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for SlabIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for SlabIndex<T> {}

impl<T> core::fmt::Debug for SlabIndex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SlabIndex({})", self.0)
    }
}

impl<T> SlabIndex<T> {
    #[inline]
    const fn slot(self) -> usize {
        self.0 as usize
    }
}

/// Occupied slot: a scheduled timer.
pub struct Node<T> {
    pub payload: T,
    pub generation: u32,
    pub next: Option<SlabIndex<T>>,
    pub prev: Option<SlabIndex<T>>,
    pub deadline: TickInstant,
}

enum Entry<T> {
    Occupied(Node<T>),
    Free {
        next: Option<SlabIndex<T>>,
        generation: u32,
    },
}

/// Fixed-capacity slab with an intrusive free list.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<SlabIndex<T>>,
    occupied: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with every slot free, or `None` when `cap` does not fit
    /// a `u32` index.
    #[must_use]
    pub fn with_capacity(cap: NonZeroUsize) -> Option<Self> {
        let capacity = u32::try_from(cap.get()).ok()?;
        let entries = (0..capacity)
            .map(|i| Entry::Free {
                next: (i + 1 < capacity).then(|| SlabIndex(i + 1, PhantomData)),
                generation: 0,
            })
            .collect();
        Some(Self {
            entries,
            free_head: Some(SlabIndex(0, PhantomData)),
            occupied: 0,
        })
    }

    /// Stores a node, or hands the payload back when the slab is full.
    pub fn alloc(&mut self, payload: T, deadline: TickInstant) -> Result<(SlabIndex<T>, u32), T> {
        let Some(head) = self.free_head else {
            return Err(payload);
        };
        let Entry::Free { next, generation } = self.entries[head.slot()] else {
            unreachable!("free list points at an occupied slot");
        };
        self.free_head = next;
        self.entries[head.slot()] = Entry::Occupied(Node {
            payload,
            generation,
            next: None,
            prev: None,
            deadline,
        });
        self.occupied += 1;
        Ok((head, generation))
    }

    /// Frees a slot, bumping its generation so outstanding handles go stale.
    pub fn free(&mut self, idx: SlabIndex<T>) -> Option<Node<T>> {
        let Entry::Occupied(node) = &self.entries[idx.slot()] else {
            return None;
        };
        let generation = node.generation.wrapping_add(1);
        let entry = std::mem::replace(
            &mut self.entries[idx.slot()],
            Entry::Free {
                next: self.free_head,
                generation,
            },
        );
        self.free_head = Some(idx);
        self.occupied -= 1;
        match entry {
            Entry::Occupied(node) => Some(node),
            Entry::Free { .. } => None,
        }
    }

    #[must_use]
    pub fn get(&self, idx: SlabIndex<T>) -> Option<&Node<T>> {
        match self.entries.get(idx.slot())? {
            Entry::Occupied(n) => Some(n),
            Entry::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, idx: SlabIndex<T>) -> Option<&mut Node<T>> {
        match self.entries.get_mut(idx.slot())? {
            Entry::Occupied(n) => Some(n),
            Entry::Free { .. } => None,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.occupied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_bumps_generation_and_reuses_slot() {
        let mut slab = Slab::with_capacity(NonZeroUsize::new(1).unwrap()).unwrap();
        let (a, gen_a) = slab.alloc(1u8, TickInstant::new(3)).unwrap();
        assert_eq!(slab.alloc(2u8, TickInstant::new(3)).err(), Some(2));
        assert_eq!(slab.free(a).map(|n| n.payload), Some(1));
        assert!(slab.free(a).is_none());
        let (b, gen_b) = slab.alloc(3u8, TickInstant::new(4)).unwrap();
        assert_eq!(a, b);
        assert_ne!(gen_a, gen_b);
        assert_eq!(slab.len(), 1);
    }
}
