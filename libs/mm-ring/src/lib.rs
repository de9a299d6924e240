//! Bounded lock-free ring buffers for cross-core messaging.
//!
//! Two flavors are provided, both power-of-two sized:
//!
//! - [`spsc`]: a single-producer single-consumer ring split into a
//!   [`spsc::Producer`] / [`spsc::Consumer`] handle pair.
//! - [`Mpmc`]: a multi-producer multi-consumer ring using per-slot sequence
//!   counters, in the Giacomoni/Scogland style: producers claim a slot by
//!   CASing the tail, publish the payload, then advance the slot's sequence;
//!   consumers mirror the dance on the head.
//!
//! Producers never block: `try_push` fails when the ring is full and the
//! caller decides whether to retry, yield, or spin with [`Backoff`]. The
//! consumer side is always a single logical owner in this codebase (the ring's
//! owning core), but `Mpmc` keeps the general algorithm so it is correct
//! regardless.
//!
//! Memory ordering contract: a `try_pop` that observes a payload also observes
//! every write the producer made before the matching `try_push` returned
//! (release/acquire pairing on the slot sequence).

#![cfg_attr(not(any(test, loom)), no_std)]

extern crate alloc;

mod backoff;
mod mpmc;
pub mod spsc;

pub use backoff::Backoff;
pub use mpmc::Mpmc;

use core::fmt;

/// Error returned by `try_push` when the ring has no free slot.
///
/// The rejected value is handed back so the producer can retry it.
pub struct Full<T>(pub T);

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ring is full")
    }
}

pub(crate) fn capacity_for(requested: usize) -> usize {
    assert!(requested >= 2, "ring capacity must be at least 2");
    requested.next_power_of_two()
}
