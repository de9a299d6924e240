//! Work submission and the per-core worker pool.
//!
//! A work item is a boxed routine produced anywhere and consumed on its
//! target core, where a worker task runs it. Each core keeps a **master**
//! task (at [`Priority::Master`]) that spawns a fresh worker whenever work
//! is queued, no idle worker exists, and the pool is below its cap; idle
//! workers park at the *front* of the pool's wait queue, so the most
//! recently idled worker is reused before the master spawns another.

use crate::cpu::Core;
use crate::sync::{WaitCell, WaitQueue};
use crate::task::{self, Priority};
use core::cell::{Cell, RefCell};
use core::fmt;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// A routine to be executed by a worker task on its target core.
pub struct WorkItem {
    routine: Box<dyn FnOnce() + Send + 'static>,
    /// The core this item is pinned to, if any. Debug builds assert the
    /// item is actually run there.
    pinned_to: Option<usize>,
}

// === impl WorkItem ===

impl WorkItem {
    pub fn new(routine: impl FnOnce() + Send + 'static) -> Self {
        Self {
            routine: Box::new(routine),
            pinned_to: None,
        }
    }

    /// Pins the item to `core`. Work is never redistributed between pools,
    /// so the pin is a contract check, not a routing input: running a
    /// pinned item on any other core is a bug, and debug builds catch it.
    pub fn pinned_to(mut self, core: usize) -> Self {
        self.pinned_to = Some(core);
        self
    }

    fn run(self) {
        if let Some(target) = self.pinned_to {
            debug_assert_eq!(
                crate::cpu::current_id(),
                Some(target),
                "pinned work item ran off its target core"
            );
        }
        (self.routine)();
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("pinned_to", &self.pinned_to)
            .finish_non_exhaustive()
    }
}

/// The per-core worker pool. Shared (by `Rc`) between the core and its
/// master/worker tasks.
pub(crate) struct WorkerPool {
    queue: RefCell<VecDeque<WorkItem>>,
    /// Idle workers; `wait_front` makes this a LIFO.
    idle: WaitQueue,
    /// Rung when work arrives and no idle worker took it.
    doorbell: WaitCell,
    live: Cell<usize>,
    max: usize,
}

// === impl WorkerPool ===

impl WorkerPool {
    pub(crate) fn new(max: usize) -> Rc<Self> {
        Rc::new(Self {
            queue: RefCell::new(VecDeque::new()),
            idle: WaitQueue::new(),
            doorbell: WaitCell::new(),
            live: Cell::new(0),
            max,
        })
    }

    /// Queues a work item and nudges a worker (or the master) to take it.
    pub(crate) fn enqueue(&self, item: WorkItem) {
        self.queue.borrow_mut().push_back(item);
        if !self.idle.wake() {
            self.doorbell.wake();
        }
    }

    pub(crate) fn close(&self) {
        self.idle.close();
        self.doorbell.close();
    }

    fn pop(&self) -> Option<WorkItem> {
        self.queue.borrow_mut().pop_front()
    }

    fn queued(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queued", &self.queued())
            .field("live", &self.live.get())
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

/// Spawns the core's master task.
pub(crate) fn spawn_master(core: &Rc<Core>) {
    core.spawn(
        master(core.pool.clone(), Rc::downgrade(core)),
        Priority::Master,
        "master",
    );
}

/// The master loop: while not stopping, top up the worker pool whenever
/// work is queued with nobody to run it.
async fn master(pool: Rc<WorkerPool>, core: Weak<Core>) {
    loop {
        {
            let Some(core) = core.upgrade() else { return };
            if core.handle.is_stopping() {
                pool.close();
                return;
            }

            while pool.queued() > 0 && pool.live.get() < pool.max && pool.idle.is_empty() {
                spawn_worker(&core);
            }
        }

        if pool.doorbell.wait().await.is_err() {
            return;
        }
    }
}

fn spawn_worker(core: &Rc<Core>) {
    let pool = core.pool.clone();
    pool.live.set(pool.live.get() + 1);
    tracing::trace!(core = core.id(), live = pool.live.get(), "spawning worker");
    core.spawn(worker(pool), Priority::Default, "worker");
}

/// A worker: run queued items until none remain, then wait at the front of
/// the idle queue to be reused.
async fn worker(pool: Rc<WorkerPool>) {
    loop {
        match pool.pop() {
            Some(item) => {
                item.run();
                // Stay cooperative between items: queued work must not
                // starve the connection tasks.
                task::yield_now().await;
            }
            None => {
                if pool.idle.wait_front().await.is_err() {
                    break;
                }
            }
        }
    }

    pool.live.set(pool.live.get() - 1);
}
