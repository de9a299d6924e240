//! Cores: one OS thread each, owning a private scheduler, timer, worker
//! pool, and (on the primary core) the event backend.
//!
//! The "current core" is a per-thread value installed for the lifetime of
//! the core's run loop, consulted by wakers to tell local wakes (straight
//! into the run queue) from remote ones (through the owner's sched ring and
//! unparker). It is deliberately scoped: nothing outside this module touches
//! the thread-local directly.

use crate::event::EventLoop;
use crate::park::{CondvarPark, Unpark};
use crate::scheduler::{RunQueue, Tick};
use crate::task::{self, JoinHandle, Priority, Task, TaskRef};
use crate::time::{CachedTime, Clock, Timer, TimerHandle};
use crate::work::{WorkItem, WorkerPool};
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::time::Duration;
use mm_ring::Mpmc;
use std::any::Any;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A deferred free: an object enqueued on its home core's chunk ring, to be
/// dropped by that core when it next drains the ring.
pub type Chunk = Box<dyn Any + Send>;

/// Longest a core sleeps before re-checking its rings and timers.
const MAX_PARK: Duration = Duration::from_secs(1);

/// Dispatch budget per loop iteration.
const TICK_BUDGET: usize = 256;

/// The shared, `Send + Sync` half of a core: everything other threads may
/// touch.
pub struct CoreHandle {
    id: usize,
    /// Tasks woken from other cores, to be scheduled on arrival.
    sched: Mpmc<TaskRef>,
    /// Submitted work items.
    inbox: Mpmc<WorkItem>,
    /// Freed objects coming home to be dropped by their owning core.
    chunks: Mpmc<Chunk>,
    stop: AtomicBool,
    unpark: Arc<dyn Unpark>,
    // scheduler counters, reported through the stats surface
    polls: AtomicU64,
    remote_wakes: AtomicU64,
    parks: AtomicU64,
    /// Objects other cores have shipped home through the chunk ring.
    frees: AtomicU64,
}

// === impl CoreHandle ===

impl CoreHandle {
    pub(crate) fn new(id: usize, ring_capacity: usize, unpark: Arc<dyn Unpark>) -> Self {
        Self {
            id,
            sched: Mpmc::new(ring_capacity),
            inbox: Mpmc::new(ring_capacity),
            chunks: Mpmc::new(ring_capacity),
            stop: AtomicBool::new(false),
            unpark,
            polls: AtomicU64::new(0),
            remote_wakes: AtomicU64::new(0),
            parks: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.unpark.unpark();
    }

    /// Routes a remotely woken task through the sched ring.
    pub(crate) fn schedule_remote(&self, task: TaskRef) {
        if self.is_stopping() {
            // The consumer may already be gone; spinning on a full ring
            // would hang the producer. Late wakes are dropped.
            drop(task);
            return;
        }
        self.remote_wakes.fetch_add(1, Ordering::Relaxed);
        self.sched.push(task);
        self.unpark.unpark();
    }

    /// Submits a work item to this core. A fresh worker task will pick it up
    /// (or an idle one will be reused).
    pub fn submit(&self, work: WorkItem) {
        // When already on the owning core, skip the ring: spinning on a full
        // ring here would prevent its own consumer from draining it.
        if current_id() == Some(self.id) {
            with_current(|core| core.pool.enqueue(work)).expect("current core vanished");
        } else if self.is_stopping() {
            // Dropped; any completion channel inside the item closes, which
            // is how callers observe the shutdown.
            drop(work);
        } else {
            self.inbox.push(work);
            self.unpark.unpark();
        }
    }

    /// Hands an object back to this core to be dropped there.
    ///
    /// The owning core is the only consumer of its chunk ring (and thus its
    /// free list); producers only ever enqueue.
    pub fn free_remote(&self, chunk: Chunk) {
        if self.is_stopping() {
            // Locality no longer matters; don't risk spinning on a ring
            // nobody drains.
            drop(chunk);
            return;
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.chunks.push(chunk);
    }

    /// (polled, remote wakes, parks) counters.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.polls.load(Ordering::Relaxed),
            self.remote_wakes.load(Ordering::Relaxed),
            self.parks.load(Ordering::Relaxed),
        )
    }

    /// Frees other cores have enqueued on this core's chunk ring.
    pub fn deferred_frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CoreHandle")
            .field("id", &self.id)
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

/// The thread-owned half of a core.
pub(crate) struct Core {
    pub(crate) handle: Arc<CoreHandle>,
    run: RefCell<RunQueue>,
    timer: RefCell<Timer>,
    clock: Clock,
    cached: Cell<CachedTime>,
    /// Only the primary core carries the event backend.
    event_loop: Option<RefCell<EventLoop>>,
    /// Secondary cores park here; the primary parks in the event backend.
    parker: Option<Arc<CondvarPark>>,
    pub(crate) pool: Rc<WorkerPool>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

/// Runs `f` with the core active on this thread, if any.
pub(crate) fn with_current<R>(f: impl FnOnce(&Core) -> R) -> Option<R> {
    CURRENT.with(|current| current.borrow().as_deref().map(f))
}

/// Id of the core running on this thread, if any.
pub(crate) fn current_id() -> Option<usize> {
    with_current(|core| core.handle.id)
}

/// Pushes a runnable task onto this thread's run queue, if this thread runs
/// the task's owning core. Hands the task back otherwise.
pub(crate) fn try_enqueue_local(task: TaskRef) -> Result<(), TaskRef> {
    CURRENT.with(|current| match current.borrow().as_deref() {
        Some(core) if core.handle.id == task.owner().id() => {
            core.run.borrow_mut().push(task);
            Ok(())
        }
        _ => Err(task),
    })
}

// === impl Core ===

impl Core {
    pub(crate) fn new(
        handle: Arc<CoreHandle>,
        clock: Clock,
        event_loop: Option<EventLoop>,
        parker: Option<Arc<CondvarPark>>,
        max_workers: usize,
    ) -> Rc<Self> {
        let cached = clock.read();
        Rc::new(Self {
            handle,
            run: RefCell::new(RunQueue::new()),
            timer: RefCell::new(Timer::new()),
            clock,
            cached: Cell::new(cached),
            event_loop: event_loop.map(RefCell::new),
            parker,
            pool: WorkerPool::new(max_workers),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.handle.id
    }

    #[inline]
    pub(crate) fn cached_time(&self) -> CachedTime {
        self.cached.get()
    }

    pub(crate) fn register_timer(&self, entry: &Rc<TimerHandle>) {
        self.timer.borrow_mut().register(entry);
    }

    pub(crate) fn cancel_timer(&self, entry: &Rc<TimerHandle>) {
        self.timer.borrow_mut().cancel(entry);
    }

    pub(crate) fn with_event_loop<R>(&self, f: impl FnOnce(&mut EventLoop) -> R) -> Option<R> {
        self.event_loop.as_ref().map(|el| f(&mut el.borrow_mut()))
    }

    /// Spawns a task on this core.
    pub(crate) fn spawn<F>(
        &self,
        future: F,
        priority: Priority,
        name: &'static str,
    ) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (task, handle) = task::new_task(future, priority, name, self.handle.clone());
        tracing::trace!(
            task.tid = handle.id(),
            task.name = name,
            core = self.handle.id,
            "spawn"
        );
        self.run.borrow_mut().push(task);
        handle
    }

    /// The core's main loop.
    ///
    /// Each iteration refreshes the cached clock, drains the three inbound
    /// rings, turns the timer, and dispatches a batch of tasks; when nothing
    /// is runnable it parks (in the event backend on the primary core, on
    /// the condvar elsewhere) until woken or until the next timer deadline,
    /// capped at one second.
    pub(crate) fn run(self: Rc<Self>) {
        let _guard = CurrentGuard::install(self.clone());
        let _span = tracing::debug_span!("core", id = self.handle.id).entered();

        crate::work::spawn_master(&self);

        loop {
            self.refresh_time();

            self.drain_rings();

            let now = self.cached.get().monotonic;
            let (fired, _) = self.timer.borrow_mut().turn(now);

            let tick = self.tick_n(TICK_BUDGET);
            self.handle
                .polls
                .fetch_add(tick.polled as u64, Ordering::Relaxed);

            tracing::trace!(
                core = self.handle.id,
                polled = tick.polled,
                completed = tick.completed,
                fired,
                "core tick"
            );

            // The stop check comes before the has-work check: a task that
            // never blocks (a spinning combiner, say) must not keep the
            // core alive past a stop request.
            if self.handle.stop.load(Ordering::Acquire) {
                break;
            }

            if tick.has_remaining || fired > 0 {
                continue;
            }

            // Re-check the rings right before parking; anything that arrived
            // after the drain above left an unpark token behind, so the park
            // below returns immediately in that case.
            if !self.handle.sched.is_empty() || !self.handle.inbox.is_empty() {
                continue;
            }

            // Re-query the deadline after ticking: polled tasks may have
            // registered new, earlier sleeps.
            let next_deadline = self.timer.borrow().next_deadline_micros();
            let timeout = match next_deadline {
                Some(deadline) => {
                    Duration::from_micros(deadline.saturating_sub(now)).min(MAX_PARK)
                }
                None => MAX_PARK,
            };

            self.park(timeout);
        }

        self.teardown();
    }

    fn drain_rings(&self) {
        while let Some(task) = self.handle.sched.try_pop() {
            self.run.borrow_mut().push(task);
        }
        while let Some(item) = self.handle.inbox.try_pop() {
            self.pool.enqueue(item);
        }
        while let Some(chunk) = self.handle.chunks.try_pop() {
            drop(chunk);
        }
    }

    fn tick_n(&self, budget: usize) -> Tick {
        let mut polled = 0;
        let mut completed = 0;

        while polled < budget {
            let Some(task) = self.run.borrow_mut().pick() else {
                break;
            };
            polled += 1;
            if Task::run(&task) {
                completed += 1;
            }
        }

        Tick {
            polled,
            completed,
            has_remaining: !self.run.borrow().is_empty(),
        }
    }

    fn park(&self, timeout: Duration) {
        self.handle.parks.fetch_add(1, Ordering::Relaxed);

        match (&self.event_loop, &self.parker) {
            (Some(event_loop), _) => {
                if let Err(err) = event_loop.borrow_mut().turn(Some(timeout)) {
                    tracing::warn!(?err, "event backend listen failed");
                }
            }
            (None, Some(parker)) => parker.park_timeout(timeout),
            (None, None) => unreachable!("core has neither event loop nor parker"),
        }
    }

    fn refresh_time(&self) {
        self.cached.set(self.clock.read());
    }

    /// Drops everything still scheduled, on this thread, so `!Send` futures
    /// are destroyed on their owning core.
    fn teardown(&self) {
        self.pool.close();

        loop {
            let drained: Vec<TaskRef> = self.run.borrow_mut().drain().collect();
            let mut any = !drained.is_empty();
            for task in drained {
                task.take_future();
            }
            while let Some(task) = self.handle.sched.try_pop() {
                task.take_future();
                any = true;
            }
            // Dropping a future can wake (and thereby re-queue) other local
            // tasks; keep draining until quiescent.
            if !any {
                break;
            }
        }

        while let Some(item) = self.handle.inbox.try_pop() {
            // dropping the item closes any completion channel inside it
            drop(item);
        }
        while let Some(chunk) = self.handle.chunks.try_pop() {
            drop(chunk);
        }

        tracing::debug!(core = self.handle.id, "core stopped");
    }
}

/// Installs/uninstalls the thread-local current core.
struct CurrentGuard;

impl CurrentGuard {
    fn install(core: Rc<Core>) -> Self {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(current.is_none(), "thread is already running a core");
            *current = Some(core);
        });
        Self
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

/// Spawns a task on the current core.
///
/// The future may be `!Send`: it will never leave this core.
///
/// # Panics
///
/// Panics if called from a thread that is not running a core.
pub fn spawn_local<F>(future: F, priority: Priority) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    spawn_local_named(future, priority, "")
}

/// [`spawn_local`] with a task name for diagnostics.
///
/// # Panics
///
/// Panics if called from a thread that is not running a core.
pub fn spawn_local_named<F>(future: F, priority: Priority, name: &'static str) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    with_current(|core| core.spawn(future, priority, name))
        .expect("spawn_local called outside of a core")
}

/// Id of the core this task is running on.
///
/// # Panics
///
/// Panics if called from a thread that is not running a core.
pub fn core_id() -> usize {
    current_id().expect("core_id called outside of a core")
}

/// Id of the core running on this thread, or `None` off-core.
pub fn try_core_id() -> Option<usize> {
    current_id()
}
