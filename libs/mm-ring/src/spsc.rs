//! Single-producer single-consumer bounded ring.
//!
//! The ring is split into a [`Producer`] and a [`Consumer`] handle at
//! construction; neither is `Clone`, which is what enforces the
//! single-producer / single-consumer discipline at the type level.

use crate::{Full, capacity_for};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem::MaybeUninit;
use mm_util::CachePadded;
use mm_util::loom::cell::UnsafeCell;
use mm_util::loom::sync::atomic::{AtomicUsize, Ordering};

/// Creates a new SPSC ring with at least `capacity` slots (rounded up to a
/// power of two).
///
/// # Panics
///
/// Panics if `capacity < 2`.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let cap = capacity_for(capacity);

    let mut slots = Vec::with_capacity(cap);
    slots.resize_with(cap, || UnsafeCell::new(MaybeUninit::uninit()));

    let shared = Arc::new(Shared {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        slots: slots.into_boxed_slice(),
    });

    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

/// The write half of an SPSC ring.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

/// The read half of an SPSC ring.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    /// Next slot the consumer will read. Written only by the consumer.
    head: CachePadded<AtomicUsize>,
    /// Next slot the producer will write. Written only by the producer.
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: values are handed from the producer thread to the consumer thread,
// so both halves require `T: Send`. The head/tail protocol below ensures a
// slot is accessed by exactly one side at a time.
unsafe impl<T: Send> Send for Shared<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Shared<T> {}

// === impl Producer ===

impl<T> Producer<T> {
    /// Attempts to enqueue `value`, failing if the ring is full.
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the rejected value when no slot is free.
    pub fn try_push(&self, value: T) -> Result<(), Full<T>> {
        let shared = &*self.shared;

        // Only this producer advances `tail`, so a relaxed load is our own
        // previous store.
        let tail = shared.tail.load(Ordering::Relaxed);
        let head = shared.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) == shared.slots.len() {
            return Err(Full(value));
        }

        shared.slots[tail & shared.mask()].with_mut(|slot| {
            // Safety: `tail - head < capacity` means the consumer has already
            // vacated this slot, and no other producer exists.
            unsafe { (*slot).write(value) };
        });

        // Publish the payload before the index advance.
        shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Returns `true` if the consumer half has been dropped.
    pub fn is_closed(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

// === impl Consumer ===

impl<T> Consumer<T> {
    /// Attempts to dequeue the oldest value, returning `None` if the ring is
    /// empty.
    pub fn try_pop(&self) -> Option<T> {
        let shared = &*self.shared;

        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let value = shared.slots[head & shared.mask()].with(|slot| {
            // Safety: `head != tail` means the producer published this slot,
            // and the acquire load of `tail` made its write visible.
            unsafe { (*slot).assume_init_read() }
        });

        // Hand the slot back to the producer.
        shared.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Number of values currently queued.
    pub fn len(&self) -> usize {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl Shared ===

impl<T> Shared<T> {
    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Both handles are gone, so the indices are quiescent.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let mask = self.mask();

        let mut i = head;
        while i != tail {
            self.slots[i & mask].with_mut(|slot| {
                // Safety: slots in `head..tail` hold initialized values that
                // were never popped.
                unsafe { (*slot).assume_init_drop() };
            });
            i = i.wrapping_add(1);
        }
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("spsc::Producer").finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("spsc::Consumer").finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn fill_then_drain() {
        let (tx, rx) = channel::<u32>(4);

        for i in 0..4 {
            tx.try_push(i).unwrap();
        }
        assert!(tx.try_push(99).is_err());

        for i in 0..4 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn wraparound_preserves_fifo() {
        let (tx, rx) = channel::<usize>(4);

        let mut next_push = 0;
        let mut next_pop = 0;
        for _ in 0..1000 {
            tx.try_push(next_push).unwrap();
            next_push += 1;
            tx.try_push(next_push).unwrap();
            next_push += 1;

            assert_eq!(rx.try_pop(), Some(next_pop));
            next_pop += 1;
            assert_eq!(rx.try_pop(), Some(next_pop));
            next_pop += 1;
        }
    }

    #[test]
    fn drops_unconsumed_values() {
        use std::sync::Arc as StdArc;

        let witness = StdArc::new(());
        let (tx, rx) = channel::<StdArc<()>>(8);
        for _ in 0..5 {
            tx.try_push(witness.clone()).unwrap();
        }
        drop(rx.try_pop());
        drop((tx, rx));

        assert_eq!(StdArc::strong_count(&witness), 1);
    }

    #[test]
    fn two_threads() {
        const N: usize = 100_000;

        let (tx, rx) = channel::<usize>(64);

        let producer = std::thread::spawn(move || {
            for i in 0..N {
                let mut value = i;
                while let Err(Full(v)) = tx.try_push(value) {
                    value = v;
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < N {
            if let Some(got) = rx.try_pop() {
                assert_eq!(got, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
    }
}
