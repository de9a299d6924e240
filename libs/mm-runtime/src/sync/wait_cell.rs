use crate::error::Closed;
use bitflags::bitflags;
use core::task::{Context, Poll, Waker};
use mm_util::CachePadded;
use mm_util::loom::cell::UnsafeCell;
use mm_util::loom::sync::atomic::{AtomicUsize, Ordering};
use mm_util::loom_const_fn;
use static_assertions::const_assert_eq;

/// An atomically registered [`Waker`].
///
/// This cell stores the [`Waker`] of a single task, which can then be woken
/// by calling [`wake`]. It is the building block for everything in this
/// runtime that needs "one waiter, one signal" semantics: socket readiness,
/// oneshot results, the master task's doorbell.
///
/// The synchronization strategy follows Tokio's `AtomicWaker` with an
/// additional close bit: a state word distinguishes an idle cell, a cell
/// that is being registered into, a cell that is being woken, a stored
/// wakeup, and a closed cell. A wakeup that arrives while no waker is
/// registered is *stored* (the `WOKEN` bit) and consumed by the next
/// [`poll_wait`], so the register/signal race always resolves in favor of
/// the waiter.
///
/// [`wake`]: Self::wake
/// [`poll_wait`]: Self::poll_wait
pub struct WaitCell {
    state: CachePadded<AtomicUsize>,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct State: usize {
        const WAITING     = 0b0000;
        const REGISTERING = 0b0001;
        const WAKING      = 0b0010;
        const WOKEN       = 0b0100;
        const CLOSED      = 0b1000;
    }
}
// WAITING must be zero so `fetch_and` can reset to it.
const_assert_eq!(State::WAITING.bits(), 0);

// Safety: access to the inner waker slot is serialized by the
// REGISTERING/WAKING state bits.
unsafe impl Send for WaitCell {}
// Safety: see above.
unsafe impl Sync for WaitCell {}

// === impl WaitCell ===

impl WaitCell {
    loom_const_fn! {
        pub const fn new() -> Self {
            Self {
                state: CachePadded::new(AtomicUsize::new(State::WAITING.bits())),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Registers the waker from `cx` and completes when the cell is woken or
    /// closed.
    ///
    /// Returns `Ready(Ok(()))` if a wakeup was already stored or arrives
    /// during registration, `Ready(Err(Closed))` if the cell was closed, and
    /// `Pending` after successfully parking the waker.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), Closed>> {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::CLOSED) => {
                return Poll::Ready(Err(Closed(())));
            }
            Err(actual) if actual.contains(State::WOKEN) => {
                // Consume the stored wakeup.
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(Ok(()));
            }
            // Someone is mid-wake; don't park, just complete.
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(Ok(()));
            }
            Err(_) => {
                // Another task is registering concurrently. A WaitCell holds
                // exactly one waiter; losing this race means the caller
                // should retry, which a spurious wake accomplishes.
                cx.waker().wake_by_ref();
                return Poll::Ready(Ok(()));
            }
            Ok(_) => {}
        }

        let waker = cx.waker();
        let prev_waker = self.waker.with_mut(|slot| {
            // Safety: the REGISTERING bit gives us exclusive slot access.
            unsafe { (*slot).replace(waker.clone()) }
        });
        if let Some(prev_waker) = prev_waker {
            prev_waker.wake();
        }

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // We were woken or closed while registering. Take the waker back
            // out and reset everything but the close bit.
            let waker = self.waker.with_mut(|slot| {
                // Safety: the waker cannot be concurrently touched until we
                // leave the REGISTERING state below.
                unsafe { (*slot).take() }
            });

            let state = self.fetch_and(State::CLOSED, Ordering::AcqRel);
            debug_assert!(
                state == actual || state == actual | State::CLOSED,
                "state changed unexpectedly while registering!"
            );

            if let Some(waker) = waker {
                waker.wake();
            }

            if state.contains(State::CLOSED) {
                return Poll::Ready(Err(Closed(())));
            }
            return Poll::Ready(Ok(()));
        }

        Poll::Pending
    }

    /// Completes when the cell is woken; see [`poll_wait`](Self::poll_wait).
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the cell was closed while (or before) waiting.
    pub async fn wait(&self) -> Result<(), Closed> {
        core::future::poll_fn(|cx| self.poll_wait(cx)).await
    }

    /// Wakes the registered waiter, or stores the wakeup for the next one.
    ///
    /// Returns `true` if a parked waker was woken by this call.
    pub fn wake(&self) -> bool {
        self.notify(State::WOKEN)
    }

    /// Closes the cell: the waiter (current or future) observes [`Closed`].
    pub fn close(&self) -> bool {
        self.notify(State::CLOSED)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.current_state().contains(State::CLOSED)
    }

    fn notify(&self, set: State) -> bool {
        let mut state = self.fetch_or(set | State::WAKING, Ordering::AcqRel);

        if state.contains(State::WAKING) || state.contains(State::REGISTERING) {
            // Someone else is waking, or a registration is in flight and will
            // observe the bit we just set.
            return false;
        }

        let waker = self.waker.with_mut(|slot| {
            // Safety: the WAKING bit we won gives us exclusive slot access.
            unsafe { (*slot).take() }
        });

        // Release the WAKING bit (keep WOKEN/CLOSED).
        state = self.fetch_and(!State::WAKING, Ordering::AcqRel);
        debug_assert!(state.contains(State::WAKING));

        if let Some(waker) = waker {
            waker.wake();
            return true;
        }
        false
    }

    fn current_state(&self) -> State {
        State::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn compare_exchange(
        &self,
        current: State,
        new: State,
        success: Ordering,
    ) -> Result<State, State> {
        self.state
            .compare_exchange(current.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_truncate)
            .map_err(State::from_bits_truncate)
    }

    fn fetch_and(&self, mask: State, order: Ordering) -> State {
        State::from_bits_truncate(self.state.fetch_and(mask.bits(), order))
    }

    fn fetch_or(&self, set: State, order: Ordering) -> State {
        State::from_bits_truncate(self.state.fetch_or(set.bits(), order))
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.current_state())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::Wake;

    struct Flag(std::sync::atomic::AtomicBool);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl Flag {
        fn take(&self) -> bool {
            self.0.swap(false, std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[test]
    fn stored_wake_completes_immediately() {
        let cell = WaitCell::new();
        assert!(!cell.wake());

        let flag = Arc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
        let waker = Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);

        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn registered_waker_is_woken() {
        let cell = WaitCell::new();

        let flag = Arc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
        let waker = Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);

        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
        assert!(cell.wake());
        assert!(flag.take());
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn close_wakes_with_error() {
        let cell = WaitCell::new();

        let flag = Arc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
        let waker = Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);

        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
        cell.close();
        assert!(flag.take());
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Err(Closed(()))));
    }
}
