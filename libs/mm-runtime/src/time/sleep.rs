use crate::time::timer::{EntryState, TimerHandle, ticks_from_micros_ceil};
use crate::time::{MonoMicros, monotonic_now};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::rc::Rc;

/// Suspends the current task for at least `duration`.
///
/// The deadline is taken against the core's cached monotonic clock at the
/// first poll. Precision is the timer wheel's tick (~1 ms); a sleep never
/// completes early.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        target: Target::In(duration),
        entry: None,
    }
}

/// Suspends the current task until the given monotonic microsecond deadline.
pub fn sleep_until(deadline: MonoMicros) -> Sleep {
    Sleep {
        target: Target::At(deadline),
        entry: None,
    }
}

/// Future returned by [`sleep`] and [`sleep_until`].
///
/// This future is fused: after completing it keeps returning `Ready`.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    target: Target,
    entry: Option<Rc<TimerHandle>>,
}

#[derive(Debug, Copy, Clone)]
enum Target {
    In(Duration),
    At(MonoMicros),
}

// === impl Sleep ===

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match &this.entry {
            None => {
                let deadline = match this.target {
                    Target::In(duration) => monotonic_now()
                        .saturating_add(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)),
                    Target::At(deadline) => deadline,
                };

                let entry = TimerHandle::new(ticks_from_micros_ceil(deadline));
                *entry.waker.borrow_mut() = Some(cx.waker().clone());

                crate::cpu::with_current(|core| core.register_timer(&entry))
                    .expect("sleep polled outside of a core");

                if entry.state.get() == EntryState::Fired {
                    this.entry = Some(entry);
                    return Poll::Ready(());
                }
                this.entry = Some(entry);
                Poll::Pending
            }
            Some(entry) => match entry.state.get() {
                EntryState::Fired => Poll::Ready(()),
                EntryState::Armed => {
                    *entry.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                EntryState::Cancelled => unreachable!("sleep still owns a cancelled entry"),
            },
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take()
            && entry.state.get() == EntryState::Armed
        {
            let _ = crate::cpu::with_current(|core| core.cancel_timer(&entry));
        }
    }
}

/// Creates a periodic ticker. The first tick completes one `period` after
/// the first poll, each subsequent deadline is the previous one plus
/// `period` (not "now plus period"), so a slow consumer does not drift.
pub fn interval(period: Duration) -> Interval {
    let period = u64::try_from(period.as_micros()).unwrap_or(u64::MAX);
    assert!(period > 0, "interval period must be non-zero");
    Interval {
        period,
        next_deadline: None,
        entry: None,
    }
}

/// A periodic timer; see [`interval`].
#[derive(Debug)]
pub struct Interval {
    period: u64,
    next_deadline: Option<MonoMicros>,
    entry: Option<Rc<TimerHandle>>,
}

// === impl Interval ===

impl Interval {
    /// Completes at the next period boundary.
    pub async fn tick(&mut self) {
        core::future::poll_fn(|cx| self.poll_tick(cx)).await;
    }

    pub fn poll_tick(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match &self.entry {
            None => {
                let deadline = match self.next_deadline {
                    Some(deadline) => deadline,
                    None => monotonic_now().saturating_add(self.period),
                };
                self.next_deadline = Some(deadline);

                let entry = TimerHandle::new(ticks_from_micros_ceil(deadline));
                *entry.waker.borrow_mut() = Some(cx.waker().clone());

                crate::cpu::with_current(|core| core.register_timer(&entry))
                    .expect("interval polled outside of a core");

                if entry.state.get() == EntryState::Fired {
                    self.complete_tick();
                    return Poll::Ready(());
                }
                self.entry = Some(entry);
                Poll::Pending
            }
            Some(entry) => match entry.state.get() {
                EntryState::Fired => {
                    self.complete_tick();
                    Poll::Ready(())
                }
                EntryState::Armed => {
                    *entry.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                EntryState::Cancelled => unreachable!("interval still owns a cancelled entry"),
            },
        }
    }

    fn complete_tick(&mut self) {
        self.entry = None;
        // periodic re-arm: expiry += period
        self.next_deadline = Some(
            self.next_deadline
                .expect("tick completed without a deadline")
                .saturating_add(self.period),
        );
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take()
            && entry.state.get() == EntryState::Armed
        {
            let _ = crate::cpu::with_current(|core| core.cancel_timer(&entry));
        }
    }
}
