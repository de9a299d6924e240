//! A hierarchical timer wheel keyed by monotonic microseconds.
//!
//! Six wheels of 64 slots each. A slot on level `L` spans `64^L` ticks, one
//! tick being 1024 µs, so the whole hierarchy tracks deadlines about two
//! years out at roughly millisecond precision. That is far coarser than
//! the clock's microsecond keys, which is fine: entries are only fired once
//! the cached clock has actually passed their slot.
//!
//! The wheel is core-local: entries are `Rc`s shared with the `Sleep`
//! futures registered on this core, and tasks never migrate, so no
//! synchronization is needed.

use crate::time::MonoMicros;
use core::cell::{Cell, RefCell};
use core::task::Waker;
use std::rc::Rc;

/// Granularity: one tick is `2^TICK_SHIFT` µs (1.024 ms).
const TICK_SHIFT: u32 = 10;

pub(crate) type Ticks = u64;

#[inline]
pub(crate) fn ticks_from_micros_ceil(micros: MonoMicros) -> Ticks {
    (micros >> TICK_SHIFT) + u64::from(micros & ((1 << TICK_SHIFT) - 1) != 0)
}

#[inline]
fn ticks_from_micros(micros: MonoMicros) -> Ticks {
    micros >> TICK_SHIFT
}

#[inline]
fn micros_from_ticks(ticks: Ticks) -> MonoMicros {
    ticks << TICK_SHIFT
}

/// One armed deadline, shared between the wheel and a `Sleep` future.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    /// Deadline in ticks.
    pub(crate) deadline: Cell<Ticks>,
    pub(crate) state: Cell<EntryState>,
    pub(crate) waker: RefCell<Option<Waker>>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum EntryState {
    Armed,
    Fired,
    Cancelled,
}

impl TimerHandle {
    pub(crate) fn new(deadline: Ticks) -> Rc<Self> {
        Rc::new(Self {
            deadline: Cell::new(deadline),
            state: Cell::new(EntryState::Armed),
            waker: RefCell::new(None),
        })
    }

    fn fire(&self) {
        self.state.set(EntryState::Fired);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct Deadline {
    ticks: Ticks,
    slot: usize,
    wheel: usize,
}

/// A per-core timer.
#[derive(Debug)]
pub struct Timer {
    /// The ticks that have elapsed since the wheel started.
    now: Ticks,
    wheels: [Wheel; Timer::WHEELS],
    len: usize,
}

// === impl Timer ===

impl Timer {
    const WHEELS: usize = Wheel::BITS;
    const MAX_SLEEP_TICKS: u64 = (1 << (Wheel::BITS * Self::WHEELS)) - 1;

    pub(crate) fn new() -> Self {
        Self {
            now: 0,
            wheels: [
                Wheel::new(0),
                Wheel::new(1),
                Wheel::new(2),
                Wheel::new(3),
                Wheel::new(4),
                Wheel::new(5),
            ],
            len: 0,
        }
    }

    /// Number of armed entries.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Registers `entry`; fires it immediately if its deadline already
    /// passed.
    pub(crate) fn register(&mut self, entry: &Rc<TimerHandle>) {
        debug_assert_eq!(entry.state.get(), EntryState::Armed);

        if entry.deadline.get() <= self.now {
            entry.fire();
            return;
        }

        self.insert_at(entry.deadline.get(), entry.clone());
        self.len += 1;
    }

    /// Cancels `entry`, unlinking it from its slot.
    pub(crate) fn cancel(&mut self, entry: &Rc<TimerHandle>) {
        if entry.state.get() != EntryState::Armed {
            return;
        }
        entry.state.set(EntryState::Cancelled);

        let deadline = entry.deadline.get();
        let wheel = self.wheel_index(deadline);
        if self.wheels[wheel].remove(deadline, entry) {
            self.len -= 1;
        }
    }

    /// Advances the wheel to `now_micros`, firing every entry whose deadline
    /// passed. Returns the number fired and the next pending deadline.
    pub(crate) fn turn(&mut self, now_micros: MonoMicros) -> (usize, Option<MonoMicros>) {
        let mut now = ticks_from_micros(now_micros);
        if now < self.now {
            now = self.now;
        }

        // Entries that need to drop to a lower-level wheel are collected and
        // re-inserted after the turn, to avoid processing them twice.
        let mut pending_reschedule = Vec::new();
        let mut fired = 0;

        let mut next_deadline = self.next_deadline();
        while let Some(deadline) = next_deadline {
            if deadline.ticks > now {
                break;
            }

            let entries = self.wheels[deadline.wheel].take_slot(deadline.slot);
            for entry in entries {
                match entry.state.get() {
                    EntryState::Cancelled => {
                        // Lazily collected; `cancel` already flipped the
                        // state but lost the race to unlink.
                        self.len -= 1;
                    }
                    EntryState::Armed if entry.deadline.get() > now => {
                        // Was parked on a higher-level wheel; needs to be
                        // rescheduled closer to its real deadline, not fired.
                        pending_reschedule.push(entry);
                    }
                    EntryState::Armed => {
                        entry.fire();
                        self.len -= 1;
                        fired += 1;
                    }
                    EntryState::Fired => unreachable!("fired entry still linked"),
                }
            }

            self.now = deadline.ticks;
            next_deadline = self.next_deadline();
        }

        self.now = now;

        let rescheduled = !pending_reschedule.is_empty();
        for entry in pending_reschedule {
            let deadline = entry.deadline.get();
            debug_assert!(deadline > self.now);
            self.insert_at(deadline, entry);
        }
        if rescheduled {
            next_deadline = self.next_deadline();
        }

        (fired, next_deadline.map(|d| micros_from_ticks(d.ticks)))
    }

    /// The earliest pending deadline, in µs, if any entries are armed.
    pub(crate) fn next_deadline_micros(&self) -> Option<MonoMicros> {
        self.next_deadline().map(|d| micros_from_ticks(d.ticks))
    }

    fn next_deadline(&self) -> Option<Deadline> {
        self.wheels
            .iter()
            .find_map(|wheel| wheel.next_deadline(self.now))
    }

    fn insert_at(&mut self, deadline: Ticks, entry: Rc<TimerHandle>) {
        let wheel = self.wheel_index(deadline);
        self.wheels[wheel].insert(deadline, entry);
    }

    #[inline]
    fn wheel_index(&self, ticks: Ticks) -> usize {
        const WHEEL_MASK: u64 = (1 << Wheel::BITS) - 1;

        // mask out the bits representing the index in the wheel
        let mut wheel_indices = self.now ^ ticks | WHEEL_MASK;

        // put sleeps over the max duration in the top level wheel
        if wheel_indices >= Self::MAX_SLEEP_TICKS {
            wheel_indices = Self::MAX_SLEEP_TICKS - 1;
        }

        let zeros = wheel_indices.leading_zeros();
        let rest = u64::BITS - 1 - zeros;

        rest as usize / Self::WHEELS
    }
}

#[derive(Debug)]
struct Wheel {
    /// A bitmap of the slots that are occupied.
    ///
    /// The least-significant bit represents slot zero.
    occupied: u64,
    slots: [Vec<Rc<TimerHandle>>; Wheel::SLOTS],
    level: usize,
    /// The number of ticks represented by a single slot in this wheel.
    ticks_per_slot: Ticks,
    /// The number of ticks represented by this entire wheel.
    ticks_per_wheel: Ticks,
    /// A bitmask for masking out all lower wheels' indices from a `now`
    /// timestamp.
    wheel_mask: u64,
}

// === impl Wheel ===

impl Wheel {
    const SLOTS: usize = 64;
    const BITS: usize = Self::SLOTS.trailing_zeros() as usize;

    fn new(level: usize) -> Self {
        let ticks_per_slot = (Self::SLOTS as u64).pow(u32::try_from(level).unwrap());
        let ticks_per_wheel = ticks_per_slot * Self::SLOTS as u64;
        let wheel_mask = !(ticks_per_wheel - 1);

        Self {
            occupied: 0,
            slots: [const { Vec::new() }; Self::SLOTS],
            level,
            ticks_per_slot,
            ticks_per_wheel,
            wheel_mask,
        }
    }

    fn insert(&mut self, deadline: Ticks, entry: Rc<TimerHandle>) {
        let slot = self.slot_index(deadline);
        self.slots[slot].push(entry);
        self.occupied |= 1 << slot;
    }

    /// Removes `entry` from the slot its deadline maps to. Returns `false`
    /// if it was not found (already taken by a concurrent turn).
    fn remove(&mut self, deadline: Ticks, entry: &Rc<TimerHandle>) -> bool {
        let slot = self.slot_index(deadline);
        let before = self.slots[slot].len();
        self.slots[slot].retain(|candidate| !Rc::ptr_eq(candidate, entry));
        let removed = self.slots[slot].len() != before;

        if self.slots[slot].is_empty() {
            self.occupied &= !(1 << slot);
        }
        removed
    }

    fn take_slot(&mut self, slot: usize) -> Vec<Rc<TimerHandle>> {
        self.occupied &= !(1 << slot);
        core::mem::take(&mut self.slots[slot])
    }

    fn next_deadline(&self, now: Ticks) -> Option<Deadline> {
        let distance = self.next_slot_distance(now)?;

        let slot = distance % Self::SLOTS;
        // does the next slot wrap this wheel around from the now slot?
        let skipped = distance.saturating_sub(Self::SLOTS);

        // when did the current rotation of this wheel begin? since all wheels
        // represent a power-of-two number of ticks, we can determine the
        // beginning of this rotation by masking out the bits for all lower
        // wheels.
        let rotation_start = now & self.wheel_mask;
        let ticks =
            rotation_start + (slot as u64 * self.ticks_per_slot) + skipped as u64 * self.ticks_per_wheel;

        Some(Deadline {
            ticks,
            slot,
            wheel: self.level,
        })
    }

    /// Returns the distance (in slots, from `now`'s slot) of the next
    /// occupied slot.
    fn next_slot_distance(&self, now: Ticks) -> Option<usize> {
        if self.occupied == 0 {
            return None;
        }

        #[expect(
            clippy::cast_possible_truncation,
            reason = "slot index is always < 64"
        )]
        let now_slot = ((now / self.ticks_per_slot) % Self::SLOTS as u64) as u32;
        next_set_bit(self.occupied, now_slot)
    }

    #[inline]
    const fn slot_index(&self, ticks: Ticks) -> usize {
        let shift = self.level * Self::BITS;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "slot index is always < 64"
        )]
        let slot = ((ticks >> shift) % Self::SLOTS as u64) as usize;
        slot
    }
}

/// Finds the index of the next set bit in `bitmap` after the `offset`th bit.
/// If the `offset`th bit is set, returns `offset`.
///
/// Based on
/// <https://github.com/torvalds/linux/blob/d0e60d46bc03252b8d4ffaaaa0b371970ac16cda/include/linux/find.h#L21-L45>
fn next_set_bit(bitmap: u64, offset: u32) -> Option<usize> {
    debug_assert!(offset < 64, "offset: {offset}");
    if bitmap == 0 {
        return None;
    }
    let shifted = bitmap >> offset;
    let zeros = if shifted == 0 {
        bitmap.rotate_right(offset).trailing_zeros()
    } else {
        shifted.trailing_zeros()
    };
    Some(zeros as usize + offset as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn_micros(timer: &mut Timer, micros: u64) -> usize {
        timer.turn(micros).0
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut timer = Timer::new();

        let near = TimerHandle::new(ticks_from_micros_ceil(2_000));
        let far = TimerHandle::new(ticks_from_micros_ceil(500_000));
        timer.register(&near);
        timer.register(&far);
        assert_eq!(timer.len(), 2);

        assert_eq!(turn_micros(&mut timer, 1_000), 0);
        assert_eq!(near.state.get(), EntryState::Armed);

        assert_eq!(turn_micros(&mut timer, 3_000), 1);
        assert_eq!(near.state.get(), EntryState::Fired);
        assert_eq!(far.state.get(), EntryState::Armed);

        assert_eq!(turn_micros(&mut timer, 600_000), 1);
        assert_eq!(far.state.get(), EntryState::Fired);
        assert_eq!(timer.len(), 0);
    }

    #[test]
    fn past_deadline_fires_at_registration() {
        let mut timer = Timer::new();
        timer.turn(10_000_000);

        let past = TimerHandle::new(ticks_from_micros_ceil(1_000));
        timer.register(&past);
        assert_eq!(past.state.get(), EntryState::Fired);
        assert_eq!(timer.len(), 0);
    }

    #[test]
    fn cancelled_entry_does_not_fire() {
        let mut timer = Timer::new();

        let entry = TimerHandle::new(ticks_from_micros_ceil(5_000));
        timer.register(&entry);
        timer.cancel(&entry);
        assert_eq!(timer.len(), 0);

        assert_eq!(turn_micros(&mut timer, 10_000), 0);
        assert_eq!(entry.state.get(), EntryState::Cancelled);
    }

    #[test]
    fn distant_deadline_drops_down_the_levels() {
        let mut timer = Timer::new();

        // ~90 seconds: lands on an upper wheel, must be rescheduled
        // downwards as time passes, and still fire exactly once.
        let entry = TimerHandle::new(ticks_from_micros_ceil(90_000_000));
        timer.register(&entry);

        let mut fired = 0;
        let mut now = 0;
        while now < 95_000_000 {
            now += 500_000;
            fired += turn_micros(&mut timer, now);
        }
        assert_eq!(fired, 1);
        assert_eq!(entry.state.get(), EntryState::Fired);
    }

    #[test]
    fn parking_on_next_deadline_fires_promptly() {
        let mut timer = Timer::new();

        let entry = TimerHandle::new(ticks_from_micros_ceil(700_000));
        timer.register(&entry);

        // Model the core loop: park until the reported deadline, turn,
        // repeat. Upper-wheel slots may report an earlier boundary (where
        // the entry drops a level), but the entry must fire within one tick
        // of its real deadline.
        let mut now = 0;
        let mut fired = 0;
        while fired == 0 {
            let next = timer.next_deadline_micros().expect("entry still armed");
            assert!(next <= 700_000 + (1 << TICK_SHIFT));
            now = now.max(next) + (1 << TICK_SHIFT);
            fired = turn_micros(&mut timer, now);
        }
        assert!(now <= 700_000 + 2 * (1 << TICK_SHIFT));
        assert_eq!(entry.state.get(), EntryState::Fired);
    }
}
