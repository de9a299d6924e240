//! Tasks: cooperatively scheduled futures pinned to a core.
//!
//! A task is created by one of the spawn APIs, enqueued on its owning core's
//! run queue, and polled by that core's dispatcher until it completes. Tasks
//! never migrate: a waker fired on another core routes the task through the
//! owner's sched ring instead of touching its run queue directly.

use crate::cpu::{self, CoreHandle};
use crate::error::JoinError;
use crate::sync::WaitCell;
use crate::sync::spin;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use mm_util::loom::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Scheduling priority band. Lower value is more urgent; the dispatcher
/// always runs the most urgent non-empty band, round-robin within it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum Priority {
    /// The per-core master task (worker pool management).
    Master = 0,
    /// Ordinary tasks.
    Default = 1,
    /// Background maintenance that should only run when nothing else will.
    Idle = 2,
}

impl Priority {
    pub(crate) const COUNT: usize = 3;

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Default
    }
}

/// Task lifecycle states. A task is in exactly one of these at any time, and
/// sits in a run queue (or sched ring) exactly when `QUEUED`.
const IDLE: u8 = 0; // blocked: waiting for a wake
const QUEUED: u8 = 1; // runnable: sitting in a run queue (or sched ring)
const RUNNING: u8 = 2; // being polled right now
const NOTIFIED: u8 = 3; // being polled, and woken again meanwhile
const COMPLETE: u8 = 4; // exited; future slot is empty

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type TaskRef = Arc<Task>;

type LocalFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// A spawned task: bookkeeping header plus the boxed future.
pub(crate) struct Task {
    id: u64,
    name: &'static str,
    priority: Priority,
    owner: Arc<CoreHandle>,
    state: AtomicU8,
    cancelled: AtomicBool,
    /// The future being driven. Only the owning core polls, takes, or drops
    /// this slot; the state machine above serializes access to it.
    future: UnsafeCell<Option<LocalFuture>>,
}

// Safety: a `TaskRef` crosses threads (rings, remote wakers), but the future
// slot is only ever touched on the owning core: polls happen in the owner's
// dispatch loop, and completion clears the slot there. `Task::drop` upholds
// the same rule for the final reference.
unsafe impl Send for Task {}
// Safety: see above; the header fields are atomics.
unsafe impl Sync for Task {}

// === impl Task ===

impl Task {
    pub(crate) fn new<F>(
        future: F,
        priority: Priority,
        name: &'static str,
        owner: Arc<CoreHandle>,
    ) -> TaskRef
    where
        F: Future<Output = ()> + 'static,
    {
        Arc::new(Task {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            priority,
            owner,
            // spawned tasks go straight into a run queue
            state: AtomicU8::new(QUEUED),
            cancelled: AtomicBool::new(false),
            future: UnsafeCell::new(Some(Box::pin(future))),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub(crate) fn owner(&self) -> &Arc<CoreHandle> {
        &self.owner
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    /// Wakes the task: marks it runnable and enqueues it with its owner.
    pub(crate) fn wake(this: &TaskRef) {
        let mut state = this.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => QUEUED,
                RUNNING => NOTIFIED,
                QUEUED | NOTIFIED | COMPLETE => return,
                _ => unreachable!("bogus task state {state}"),
            };

            match this.state.compare_exchange_weak(
                state,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == QUEUED {
                        schedule(this.clone());
                    }
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }

    /// Polls the task once. Returns `true` when the task completed (or was
    /// cancelled) and should not be queued again.
    ///
    /// Must only be called by the owning core's dispatcher, with the task in
    /// the `QUEUED` state.
    pub(crate) fn run(this: &TaskRef) -> bool {
        debug_assert_eq!(this.state.load(Ordering::Acquire), QUEUED);
        this.state.store(RUNNING, Ordering::Release);

        if this.cancelled.load(Ordering::Acquire) {
            tracing::trace!(task.tid = this.id, task.name = this.name, "task cancelled");
            this.take_future();
            this.state.store(COMPLETE, Ordering::Release);
            return true;
        }

        let waker = this.clone().into_waker();
        let mut cx = Context::from_waker(&waker);

        let poll = this.future.with_mut(|slot| {
            // Safety: the RUNNING state gives the dispatcher exclusive
            // access to the future slot.
            match unsafe { (*slot).as_mut() } {
                Some(future) => future.as_mut().poll(&mut cx),
                None => Poll::Ready(()),
            }
        });

        match poll {
            Poll::Ready(()) => {
                tracing::trace!(task.tid = this.id, task.name = this.name, "task exited");
                this.take_future();
                this.state.store(COMPLETE, Ordering::Release);
                true
            }
            Poll::Pending => {
                match this.state.compare_exchange(
                    RUNNING,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => false,
                    Err(actual) => {
                        // Woken during the poll: immediately runnable again.
                        debug_assert_eq!(actual, NOTIFIED);
                        this.state.store(QUEUED, Ordering::Release);
                        schedule(this.clone());
                        false
                    }
                }
            }
        }
    }

    /// Drops the future in place. Owner-core only.
    pub(crate) fn take_future(&self) {
        self.future.with_mut(|slot| {
            // Safety: called from the owning core (dispatch or shutdown
            // drain), where the state machine guarantees exclusive access.
            unsafe { (*slot).take() };
        });
    }

    fn into_waker(self: Arc<Self>) -> Waker {
        // Safety: the vtable below upholds the RawWaker contract; the data
        // pointer is a `TaskRef` in raw form.
        unsafe { Waker::from_raw(Self::into_raw_waker(self)) }
    }

    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    fn into_raw_waker(this: TaskRef) -> RawWaker {
        RawWaker::new(Arc::into_raw(this).cast::<()>(), &Self::WAKER_VTABLE)
    }

    unsafe fn waker_clone(raw: *const ()) -> RawWaker {
        // Safety: `raw` came from `Arc::into_raw` in `into_raw_waker`.
        unsafe {
            Arc::increment_strong_count(raw.cast::<Task>());
        }
        RawWaker::new(raw, &Self::WAKER_VTABLE)
    }

    unsafe fn waker_wake(raw: *const ()) {
        // Safety: consumes the reference the raw waker held.
        let task = unsafe { Arc::from_raw(raw.cast::<Task>()) };
        Task::wake(&task);
    }

    unsafe fn waker_wake_by_ref(raw: *const ()) {
        // Safety: borrow without consuming; forget the temporary Arc below.
        let task = unsafe { Arc::from_raw(raw.cast::<Task>()) };
        Task::wake(&task);
        core::mem::forget(task);
    }

    unsafe fn waker_drop(raw: *const ()) {
        // Safety: consumes the reference the raw waker held.
        drop(unsafe { Arc::from_raw(raw.cast::<Task>()) });
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // The future should have been taken on the owning core. If the last
        // reference dies elsewhere with the future still in place (a remote
        // waker outliving a torn-down core), dropping a `!Send` future here
        // would be unsound, so it is leaked instead. This only happens on
        // shutdown edges.
        if cpu::current_id() == Some(self.owner.id()) {
            return;
        }
        self.future.with_mut(|slot| {
            // Safety: last reference, no concurrent access.
            if let Some(future) = unsafe { (*slot).take() } {
                tracing::debug!(
                    task.tid = self.id,
                    task.name = self.name,
                    "task dropped off-core with a live future; leaking it"
                );
                core::mem::forget(future);
            }
        });
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Enqueues a runnable task: locally when we are on the owning core,
/// remotely via the owner's sched ring (plus an unpark) otherwise.
fn schedule(task: TaskRef) {
    match cpu::try_enqueue_local(task) {
        Ok(()) => {}
        Err(task) => {
            let owner = task.owner.clone();
            owner.schedule_remote(task);
        }
    }
}

// === JoinHandle ===

/// Owner side of a spawned task's output.
///
/// Awaiting the handle yields the task's output, or [`JoinError::Cancelled`]
/// if the task was cancelled (or torn down at shutdown) before completing.
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    inner: Arc<JoinInner<T>>,
    task: TaskRef,
}

pub(crate) struct JoinInner<T> {
    value: spin::Mutex<Option<T>>,
    cell: WaitCell,
}

// === impl JoinHandle ===

impl<T> JoinHandle<T> {
    pub fn id(&self) -> u64 {
        self.task.id()
    }

    /// Requests cancellation: the task is dropped at its next scheduling
    /// point without being polled again (best-effort, cooperative).
    pub fn cancel(&self) {
        self.task.cancel();
        Task::wake(&self.task);
    }

    pub fn is_complete(&self) -> bool {
        self.task.is_complete()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            if let Some(value) = self.inner.value.lock().take() {
                return Poll::Ready(Ok(value));
            }

            match core::task::ready!(self.inner.cell.poll_wait(cx)) {
                Ok(()) => {
                    // Woken: re-check the value; spurious wakes loop back.
                }
                Err(_) => {
                    let value = self.inner.value.lock().take();
                    return Poll::Ready(value.ok_or(JoinError::Cancelled));
                }
            }
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

/// Builds the task wrapper that routes the future's output into a
/// [`JoinHandle`], closing the handle if the task dies without an output.
pub(crate) fn new_task<F>(
    future: F,
    priority: Priority,
    name: &'static str,
    owner: Arc<CoreHandle>,
) -> (TaskRef, JoinHandle<F::Output>)
where
    F: Future + 'static,
    F::Output: 'static,
{
    let inner = Arc::new(JoinInner {
        value: spin::Mutex::new(None),
        cell: WaitCell::new(),
    });

    struct Guard<T> {
        inner: Arc<JoinInner<T>>,
    }

    impl<T> Drop for Guard<T> {
        fn drop(&mut self) {
            if self.inner.value.lock().is_some() {
                self.inner.cell.wake();
            } else {
                // Dropped without an output: cancelled or torn down.
                self.inner.cell.close();
            }
        }
    }

    let wrapped = {
        let inner = inner.clone();
        async move {
            let guard = Guard { inner };
            let output = future.await;
            *guard.inner.value.lock() = Some(output);
            // the guard's drop wakes the join handle
        }
    };

    let task = Task::new(wrapped, priority, name, owner);
    let handle = JoinHandle {
        inner,
        task: task.clone(),
    };
    (task, handle)
}

/// Yields the current task back to the dispatcher, letting every other
/// runnable task of equal or higher priority run first.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
