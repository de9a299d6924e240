//! Time: the microsecond clock and the per-core timer wheel.
//!
//! Every core caches "now" (monotonic and realtime microseconds) once per
//! scheduling loop iteration; tasks read the cached value instead of hitting
//! the clock syscall at every use.

mod sleep;
mod timer;

pub use sleep::{Interval, Sleep, interval, sleep, sleep_until};
pub use timer::Timer;
pub(crate) use timer::TimerHandle;

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use pin_project::pin_project;
use std::time::{Instant as StdInstant, SystemTime, UNIX_EPOCH};

/// Microseconds from an arbitrary (per-process) monotonic epoch.
pub type MonoMicros = u64;

/// Microseconds since the Unix epoch.
pub type RealMicros = u64;

/// The process-wide time source.
///
/// Monotonic readings are measured against a base captured when the runtime
/// was created, so they start near zero and comfortably fit 64 bits.
#[derive(Debug, Clone)]
pub struct Clock {
    base: StdInstant,
}

/// A cached `(monotonic, realtime)` pair, refreshed once per core loop tick.
#[derive(Debug, Copy, Clone)]
pub struct CachedTime {
    pub monotonic: MonoMicros,
    pub realtime: RealMicros,
}

// === impl Clock ===

impl Clock {
    pub fn new() -> Self {
        Self {
            base: StdInstant::now(),
        }
    }

    pub fn monotonic_micros(&self) -> MonoMicros {
        u64::try_from(self.base.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    pub fn realtime_micros(&self) -> RealMicros {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    pub fn read(&self) -> CachedTime {
        CachedTime {
            monotonic: self.monotonic_micros(),
            realtime: self.realtime_micros(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// The current core's cached monotonic time, in microseconds.
///
/// # Panics
///
/// Panics if called from a thread that is not running a core.
pub fn monotonic_now() -> MonoMicros {
    crate::cpu::with_current(|core| core.cached_time().monotonic)
        .expect("monotonic_now() called outside of a core")
}

/// The current core's cached realtime clock, in microseconds since the epoch.
///
/// # Panics
///
/// Panics if called from a thread that is not running a core.
pub fn realtime_now() -> RealMicros {
    crate::cpu::with_current(|core| core.cached_time().realtime)
        .expect("realtime_now() called outside of a core")
}

/// Error returned by [`timeout`] when the inner future did not complete in
/// time. A timeout is a value, not a fault: callers decide what it means.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Elapsed(());

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("deadline has elapsed")
    }
}

impl core::error::Error for Elapsed {}

/// Requires `future` to complete within `duration`.
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    Timeout {
        future,
        sleep: sleep(duration),
    }
}

/// Future returned by [`timeout`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    #[pin]
    future: F,
    #[pin]
    sleep: Sleep,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(out) = this.future.poll(cx) {
            return Poll::Ready(Ok(out));
        }

        this.sleep.poll(cx).map(|()| Err(Elapsed(())))
    }
}
