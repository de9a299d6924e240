//! The event backend: an abstraction over epoll (Linux) and kqueue (BSDs).
//!
//! One instance exists per process, owned by the primary core. Watched file
//! descriptors are registered one-shot: after a readiness delivery the fd is
//! disarmed until the interested task re-arms it. Registration changes are
//! buffered and applied inside [`EventLoop::turn`], on the owning thread,
//! right before the backend sleeps.
//!
//! The self-pipe is one watched fd whose only job is to make `listen`
//! return: remote cores write a byte to wake the primary core out of its
//! sleep.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;

use crate::park::Unpark;
use bitflags::bitflags;
use core::cell::{Cell, RefCell};
use core::task::{Context, Poll, Waker};
use core::time::Duration;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

bitflags! {
    /// What a task wants to be told about an fd.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub(crate) struct Interest: u8 {
        const INPUT  = 0b01;
        const OUTPUT = 0b10;
    }
}

bitflags! {
    /// What the backend delivered for an fd.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub(crate) struct Readiness: u8 {
        const INPUT        = 0b0001;
        const OUTPUT       = 0b0010;
        const INPUT_ERROR  = 0b0100;
        const OUTPUT_ERROR = 0b1000;
    }
}

impl Readiness {
    const READ_BITS: Readiness = Readiness::INPUT
        .union(Readiness::INPUT_ERROR)
        .union(Readiness::OUTPUT_ERROR);
    const WRITE_BITS: Readiness = Readiness::OUTPUT
        .union(Readiness::OUTPUT_ERROR)
        .union(Readiness::INPUT_ERROR);
}

pub(crate) type Token = usize;

/// Token reserved for the self-pipe; never handed to a source.
pub(crate) const WAKE_TOKEN: Token = usize::MAX;

/// A buffered registration change, applied in `listen`.
#[derive(Debug)]
pub(crate) enum Change {
    /// Starts watching `fd` with no interests armed.
    Register {
        fd: RawFd,
        token: Token,
    },
    /// Arms (one-shot) the given interests for `fd`.
    Arm {
        fd: RawFd,
        token: Token,
        interest: Interest,
    },
    Unregister {
        fd: RawFd,
    },
}

/// A translated readiness delivery.
#[derive(Debug, Copy, Clone)]
pub(crate) struct EventOut {
    pub(crate) token: Token,
    pub(crate) readiness: Readiness,
}

/// The OS-specific half of the event loop.
pub(crate) trait Backend {
    /// Applies `changes`, then waits up to `timeout` for events, appending
    /// translated deliveries to `events`. The self-pipe is drained
    /// internally and never reported.
    fn listen(
        &mut self,
        changes: &mut Vec<Change>,
        events: &mut Vec<EventOut>,
        timeout: Option<Duration>,
    ) -> io::Result<()>;
}

/// Creates the platform backend with the given self-pipe read end.
pub(crate) fn platform_backend(wake_rx: OwnedFd) -> io::Result<Box<dyn Backend>> {
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        Ok(Box::new(kqueue::Kqueue::new(wake_rx)?))
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        Ok(Box::new(epoll::Epoll::new(wake_rx)?))
    }
}

/// The wake half of the self-pipe: writing a byte makes the primary core's
/// `listen` return. Saturating the pipe is fine, a single unread byte keeps
/// the fd readable.
#[derive(Debug)]
pub(crate) struct PipeUnpark {
    wake_tx: OwnedFd,
}

impl PipeUnpark {
    pub(crate) fn new(wake_tx: OwnedFd) -> Self {
        Self { wake_tx }
    }
}

impl Unpark for PipeUnpark {
    fn unpark(&self) {
        let byte = [1u8];
        // Safety: plain write(2) on an fd we own; EAGAIN (pipe full) is as
        // good as success here.
        let _ = unsafe { libc::write(self.wake_tx.as_raw_fd(), byte.as_ptr().cast(), 1) };
    }
}

// Safety: PipeUnpark only carries an fd and write(2) is thread-safe.
unsafe impl Send for PipeUnpark {}
// Safety: see above.
unsafe impl Sync for PipeUnpark {}

/// Per-fd registration record shared between the event loop and the I/O
/// wrapper holding the fd. Core-local.
#[derive(Debug)]
pub(crate) struct SourceShared {
    token: Token,
    fd: RawFd,
    /// Delivered-but-unconsumed readiness.
    readiness: Cell<Readiness>,
    read_waker: RefCell<Option<Waker>>,
    write_waker: RefCell<Option<Waker>>,
}

// === impl SourceShared ===

impl SourceShared {
    fn wake_for(&self, readiness: Readiness) {
        self.readiness.set(self.readiness.get() | readiness);

        if readiness.intersects(Readiness::READ_BITS)
            && let Some(waker) = self.read_waker.borrow_mut().take()
        {
            waker.wake();
        }
        if readiness.intersects(Readiness::WRITE_BITS)
            && let Some(waker) = self.write_waker.borrow_mut().take()
        {
            waker.wake();
        }
    }
}

/// The registration layer above the backend. Owned by the primary core.
pub(crate) struct EventLoop {
    backend: Box<dyn Backend>,
    changes: Vec<Change>,
    events: Vec<EventOut>,
    sources: Vec<Option<Rc<SourceShared>>>,
    free_tokens: Vec<Token>,
}

// === impl EventLoop ===

impl EventLoop {
    pub(crate) fn new(wake_rx: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            backend: platform_backend(wake_rx)?,
            changes: Vec::new(),
            events: Vec::with_capacity(256),
            sources: Vec::new(),
            free_tokens: Vec::new(),
        })
    }

    /// Starts watching `fd` (no interests armed yet).
    pub(crate) fn register(&mut self, fd: RawFd) -> Rc<SourceShared> {
        let token = match self.free_tokens.pop() {
            Some(token) => token,
            None => {
                self.sources.push(None);
                self.sources.len() - 1
            }
        };
        debug_assert_ne!(token, WAKE_TOKEN);

        let source = Rc::new(SourceShared {
            token,
            fd,
            readiness: Cell::new(Readiness::empty()),
            read_waker: RefCell::new(None),
            write_waker: RefCell::new(None),
        });
        self.sources[token] = Some(source.clone());
        self.changes.push(Change::Register { fd, token });
        source
    }

    /// Arms one-shot interests for the source.
    pub(crate) fn arm(&mut self, source: &SourceShared, interest: Interest) {
        self.changes.push(Change::Arm {
            fd: source.fd,
            token: source.token,
            interest,
        });
    }

    pub(crate) fn deregister(&mut self, source: &SourceShared) {
        self.changes.push(Change::Unregister { fd: source.fd });
        self.sources[source.token] = None;
        self.free_tokens.push(source.token);
    }

    /// Applies pending changes, sleeps for up to `timeout`, and dispatches
    /// readiness to the registered wakers. Returns the number of deliveries.
    pub(crate) fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.events.clear();
        self.backend
            .listen(&mut self.changes, &mut self.events, timeout)?;

        let mut delivered = 0;
        for event in &self.events {
            let Some(Some(source)) = self.sources.get(event.token) else {
                // Raced with deregistration; stale delivery.
                continue;
            };
            source.wake_for(event.readiness);
            delivered += 1;
        }
        Ok(delivered)
    }
}

impl core::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLoop")
            .field("sources", &self.sources.len())
            .field("pending_changes", &self.changes.len())
            .finish_non_exhaustive()
    }
}

/// A watched file descriptor, owned by an I/O wrapper on the primary core.
///
/// `poll_readable`/`poll_writable` follow the usual readiness dance: consume
/// stored readiness if present, otherwise park the waker and arm the
/// interest one-shot.
#[derive(Debug)]
pub(crate) struct IoSource {
    shared: Rc<SourceShared>,
}

// === impl IoSource ===

impl IoSource {
    /// Registers `fd` with the current core's event loop.
    ///
    /// # Errors
    ///
    /// Fails if the current thread is not running the core that owns the
    /// event backend.
    pub(crate) fn new(fd: RawFd) -> io::Result<Self> {
        let shared = crate::cpu::with_current(|core| {
            core.with_event_loop(|event_loop| event_loop.register(fd))
        })
        .flatten()
        .ok_or_else(|| {
            io::Error::other("no event backend on this core (I/O must run on the primary core)")
        })?;

        Ok(Self { shared })
    }

    pub(crate) fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.poll_ready(cx, Interest::INPUT, Readiness::READ_BITS, &self.shared.read_waker)
    }

    pub(crate) fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.poll_ready(
            cx,
            Interest::OUTPUT,
            Readiness::WRITE_BITS,
            &self.shared.write_waker,
        )
    }

    /// Consumes stored readiness after the syscall reported `WouldBlock`, so
    /// the next poll arms the backend again.
    pub(crate) fn clear_readiness(&self, interest: Interest) {
        let mut readiness = self.shared.readiness.get();
        if interest.contains(Interest::INPUT) {
            readiness &= !Readiness::INPUT;
        }
        if interest.contains(Interest::OUTPUT) {
            readiness &= !Readiness::OUTPUT;
        }
        self.shared.readiness.set(readiness);
    }

    fn poll_ready(
        &self,
        cx: &mut Context<'_>,
        interest: Interest,
        bits: Readiness,
        waker_slot: &RefCell<Option<Waker>>,
    ) -> Poll<()> {
        if self.shared.readiness.get().intersects(bits) {
            return Poll::Ready(());
        }

        *waker_slot.borrow_mut() = Some(cx.waker().clone());
        let armed = crate::cpu::with_current(|core| {
            core.with_event_loop(|event_loop| event_loop.arm(&self.shared, interest))
        });
        debug_assert!(
            matches!(armed, Some(Some(()))),
            "IoSource polled off the event-loop core"
        );
        Poll::Pending
    }
}

impl Drop for IoSource {
    fn drop(&mut self) {
        let _ = crate::cpu::with_current(|core| {
            core.with_event_loop(|event_loop| event_loop.deregister(&self.shared))
        });
    }
}
