//! Runtime assembly: builds the cores, spawns the worker threads, and runs
//! the primary core on the calling thread.

use crate::cpu::{self, Core, CoreHandle};
use crate::event::{EventLoop, PipeUnpark};
use crate::park::{CondvarPark, Unpark};
use crate::task::{self, JoinHandle, Priority};
use crate::time::Clock;
use crate::work::WorkItem;
use core::future::Future;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Runtime configuration knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker threads, one per core. Default: detected CPU count
    /// (fallback 1).
    pub cores: usize,
    /// Worker-task cap per core.
    pub max_workers: usize,
    /// Capacity of each core's sched/inbox/chunks rings (rounded up to a
    /// power of two).
    pub ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cores: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            max_workers: 256,
            ring_capacity: 1024,
        }
    }
}

/// A built runtime, ready to [`run`](Runtime::run).
///
/// The runtime is not `Send`: the thread that builds it becomes the primary
/// core (the one owning the event backend).
pub struct Runtime {
    handle: Handle,
    clock: Clock,
    config: Config,
    event_loop: Option<EventLoop>,
    parkers: Vec<Arc<CondvarPark>>,
}

/// A cloneable, `Send` handle for submitting work and stopping the runtime.
#[derive(Debug, Clone)]
pub struct Handle {
    cores: Arc<[Arc<CoreHandle>]>,
    next: Arc<AtomicUsize>,
}

// === impl Runtime ===

impl Runtime {
    /// Builds a runtime per `config`.
    ///
    /// # Errors
    ///
    /// Fails if the self-pipe or the event backend cannot be created.
    pub fn new(config: Config) -> io::Result<Self> {
        assert!(config.cores >= 1, "a runtime needs at least one core");

        let clock = Clock::new();
        let (wake_rx, wake_tx) = wake_pipe()?;
        let pipe_unpark = Arc::new(PipeUnpark::new(wake_tx));
        let event_loop = EventLoop::new(wake_rx)?;

        let mut cores = Vec::with_capacity(config.cores);
        let mut parkers = Vec::with_capacity(config.cores.saturating_sub(1));

        let primary_unpark: Arc<dyn Unpark> = pipe_unpark;
        cores.push(Arc::new(CoreHandle::new(
            0,
            config.ring_capacity,
            primary_unpark,
        )));
        for id in 1..config.cores {
            let parker = Arc::new(CondvarPark::new());
            let unpark: Arc<dyn Unpark> = parker.clone();
            cores.push(Arc::new(CoreHandle::new(id, config.ring_capacity, unpark)));
            parkers.push(parker);
        }

        Ok(Self {
            handle: Handle {
                cores: cores.into(),
                next: Arc::new(AtomicUsize::new(0)),
            },
            clock,
            config,
            event_loop: Some(event_loop),
            parkers,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Spawns the secondary core threads, runs `init` as the first task on
    /// the primary core, and drives the primary core on the calling thread
    /// until the runtime is stopped.
    ///
    /// # Panics
    ///
    /// Panics if a core thread cannot be spawned.
    pub fn run<F>(mut self, init: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let mut threads = Vec::with_capacity(self.parkers.len());
        for (i, parker) in self.parkers.drain(..).enumerate() {
            let id = i + 1;
            let handle = self.handle.cores[id].clone();
            let clock = self.clock.clone();
            let max_workers = self.config.max_workers;

            let thread = std::thread::Builder::new()
                .name(format!("mm-core-{id}"))
                .spawn(move || {
                    let core = Core::new(handle, clock, None, Some(parker), max_workers);
                    core.run();
                })
                .expect("failed to spawn core thread");
            threads.push(thread);
        }

        let core = Core::new(
            self.handle.cores[0].clone(),
            self.clock.clone(),
            self.event_loop.take(),
            None,
            self.config.max_workers,
        );
        core.spawn(init, Priority::Default, "init");
        core.run();

        for thread in threads {
            let _ = thread.join();
        }
    }
}

// === impl Handle ===

impl Handle {
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// The shared handle of core `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn core(&self, id: usize) -> &Arc<CoreHandle> {
        &self.cores[id]
    }

    pub fn cores(&self) -> impl Iterator<Item = &Arc<CoreHandle>> {
        self.cores.iter()
    }

    /// Submits work to a specific core, pinned there.
    pub fn submit_to(&self, core: usize, routine: impl FnOnce() + Send + 'static) {
        self.cores[core].submit(WorkItem::new(routine).pinned_to(core));
    }

    /// Submits work to the next core, round-robin.
    pub fn submit(&self, routine: impl FnOnce() + Send + 'static) {
        let core = self.next.fetch_add(1, Ordering::Relaxed) % self.cores.len();
        self.cores[core].submit(WorkItem::new(routine));
    }

    /// Spawns a future on a specific core from any thread.
    pub fn spawn_on<F>(
        &self,
        core: usize,
        future: F,
        priority: Priority,
        name: &'static str,
    ) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let owner = self.cores[core].clone();
        let (task, join) = task::new_task(future, priority, name, owner.clone());
        match cpu::try_enqueue_local(task) {
            Ok(()) => {}
            Err(task) => owner.schedule_remote(task),
        }
        join
    }

    /// Stops every core and unparks them so they notice.
    pub fn stop(&self) {
        for core in self.cores.iter() {
            core.stop();
        }
    }
}

/// Creates the nonblocking, close-on-exec self-pipe.
fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // Safety: pipe2 fills `fds` on success; checked below.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        // Safety: pipe fills `fds` on success; checked below.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            // Safety: fcntl on fds we just created.
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
    }

    // Safety: both fds were just returned by the kernel and are owned here.
    let rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // Safety: see above.
    let tx = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((rx, tx))
}
