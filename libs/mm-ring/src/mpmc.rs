//! Multi-producer multi-consumer bounded ring.
//!
//! Each slot carries a sequence counter that doubles as the slot's publish
//! "lock": a producer claims a position by CASing the shared tail, writes the
//! payload, then stores `pos + 1` into the slot sequence to publish it; a
//! consumer claims a position by CASing the head, reads the payload once the
//! sequence shows `pos + 1`, then stores `pos + capacity` to recycle the slot
//! for the producer lap that will next reach it.
//!
//! Unlike an intrusive node queue this ring moves values, which is what the
//! cross-core messages here are: machine-word-sized task and work handles.

use crate::{Backoff, Full, capacity_for};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::mem::MaybeUninit;
use mm_util::CachePadded;
use mm_util::loom::cell::UnsafeCell;
use mm_util::loom::sync::atomic::{AtomicUsize, Ordering};

/// A bounded MPMC ring with at least the requested capacity (rounded up to a
/// power of two).
pub struct Mpmc<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: Box<[Slot<T>]>,
}

struct Slot<T> {
    /// Publish counter; see the module docs for the protocol.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: values cross threads through the ring, so `T: Send` is required.
// The per-slot sequence protocol guarantees exclusive access to `value`
// between the claim and the publish on both sides.
unsafe impl<T: Send> Send for Mpmc<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Mpmc<T> {}

// === impl Mpmc ===

impl<T> Mpmc<T> {
    /// Creates a ring with at least `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2`.
    pub fn new(capacity: usize) -> Self {
        let cap = capacity_for(capacity);

        let mut slots = Vec::with_capacity(cap);
        for i in 0..cap {
            slots.push(Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }

        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Attempts to enqueue `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the rejected value when the ring is full; the
    /// caller yields and retries (or uses [`push`](Self::push) at sites where
    /// the enqueue must succeed).
    pub fn try_push(&self, value: T) -> Result<(), Full<T>> {
        let mut backoff = Backoff::new();
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[tail & self.mask()];
            let seq = slot.seq.load(Ordering::Acquire);
            // How far the slot sequence is ahead of our claimed position.
            // Wrapping arithmetic keeps this meaningful across index wrap.
            let ahead = seq.wrapping_sub(tail);

            if ahead == 0 {
                // Slot is free for this lap; try to claim the position.
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.value.with_mut(|v| {
                            // Safety: the CAS above gave us exclusive
                            // ownership of this slot until we bump `seq`.
                            unsafe { (*v).write(value) };
                        });
                        // Publish: consumers wait for `pos + 1`.
                        slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => {
                        tail = current;
                        backoff.spin();
                    }
                }
            } else if ahead <= self.slots.len() {
                // Another producer advanced past our stale tail; reload.
                tail = self.tail.load(Ordering::Relaxed);
                backoff.spin();
            } else {
                // The sequence is behind the position: the previous lap's
                // value still occupies the slot, so the ring is full.
                return Err(Full(value));
            }
        }
    }

    /// Enqueues `value`, spinning with exponential backoff until a slot frees
    /// up. For sites where dropping the message is not an option.
    pub fn push(&self, mut value: T) {
        let mut backoff = Backoff::new();
        loop {
            match self.try_push(value) {
                Ok(()) => return,
                Err(Full(v)) => {
                    value = v;
                    backoff.spin();
                }
            }
        }
    }

    /// Attempts to dequeue the oldest value.
    pub fn try_pop(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[head & self.mask()];
            let seq = slot.seq.load(Ordering::Acquire);
            let expected = head.wrapping_add(1);
            let ahead = seq.wrapping_sub(expected);

            if ahead == 0 {
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = slot.value.with(|v| {
                            // Safety: the CAS gave us exclusive ownership of
                            // this published slot until we bump `seq`.
                            unsafe { (*v).assume_init_read() }
                        });
                        // Recycle: the producer lap expects `pos + capacity`.
                        slot.seq
                            .store(head.wrapping_add(self.slots.len()), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => {
                        head = current;
                        backoff.spin();
                    }
                }
            } else if ahead <= self.slots.len() {
                // Another consumer advanced past our stale head; reload.
                head = self.head.load(Ordering::Relaxed);
                backoff.spin();
            } else {
                // Sequence still shows the producer lap: nothing published
                // at this position, the ring is empty.
                return None;
            }
        }
    }

    /// Number of values currently queued. Approximate under concurrency.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Mpmc<T> {
    fn drop(&mut self) {
        // Indices are quiescent under `&mut self`.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let mask = self.mask();

        let mut i = head;
        while i != tail {
            self.slots[i & mask].value.with_mut(|v| {
                // Safety: slots in `head..tail` were published and never
                // consumed.
                unsafe { (*v).assume_init_drop() };
            });
            i = i.wrapping_add(1);
        }
    }
}

impl<T> fmt::Debug for Mpmc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mpmc")
            .field("capacity", &self.slots.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn fifo_single_thread() {
        let ring = Mpmc::new(8);
        for i in 0..8 {
            ring.try_push(i).unwrap();
        }
        assert!(ring.try_push(99).is_err());
        for i in 0..8 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn no_loss_no_duplication() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 2;
        const PER_PRODUCER: usize = 10_000;

        let ring = Arc::new(Mpmc::new(64));
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    ring.push(p * PER_PRODUCER + i);
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let ring = ring.clone();
            consumers.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match ring.try_pop() {
                        Some(v) => {
                            if v == usize::MAX {
                                return seen;
                            }
                            seen.push(v);
                        }
                        None => std::thread::yield_now(),
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        for _ in 0..CONSUMERS {
            ring.push(usize::MAX);
        }

        let mut all = BTreeSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "duplicated value {v}");
            }
        }
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER, "lost values");
    }

    #[test]
    fn per_producer_order_is_preserved() {
        // FIFO of successful operations: with a single producer and a single
        // consumer running concurrently, pops must come out in push order.
        let ring = Arc::new(Mpmc::new(4));

        let tx = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 0..50_000_usize {
                    ring.push(i);
                }
            })
        };

        let mut expected = 0;
        while expected < 50_000 {
            if let Some(v) = ring.try_pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }

        tx.join().unwrap();
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use alloc::sync::Arc;
    use mm_util::loom;

    #[test]
    fn two_producers_one_consumer() {
        loom::model(|| {
            let ring = Arc::new(Mpmc::new(2));

            let a = {
                let ring = ring.clone();
                loom::thread::spawn(move || ring.try_push(1u32).is_ok())
            };
            let b = {
                let ring = ring.clone();
                loom::thread::spawn(move || ring.try_push(2u32).is_ok())
            };

            let pushed_a = a.join().unwrap();
            let pushed_b = b.join().unwrap();

            let mut got = alloc::vec::Vec::new();
            while let Some(v) = ring.try_pop() {
                got.push(v);
            }

            let expected = usize::from(pushed_a) + usize::from(pushed_b);
            assert_eq!(got.len(), expected);
        });
    }
}
