//! epoll backend (Linux).
//!
//! Watched fds use `EPOLLONESHOT`: a delivery disarms the fd until the
//! interested task arms it again, so a socket that stays readable does not
//! spin the dealer loop. The self-pipe is the one level-triggered exception.

#![expect(
    clippy::cast_sign_loss,
    reason = "libc epoll flag constants are non-negative i32s"
)]

use crate::event::{Backend, Change, EventOut, Interest, Readiness, Token, WAKE_TOKEN};
use core::time::Duration;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub(crate) struct Epoll {
    epfd: OwnedFd,
    wake_rx: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

// === impl Epoll ===

impl Epoll {
    const EVENTS: usize = 256;

    pub(crate) fn new(wake_rx: OwnedFd) -> io::Result<Self> {
        // Safety: plain syscall, the result is checked below.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: `epfd` was just returned by epoll_create1.
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };

        let this = Self {
            epfd,
            wake_rx,
            buf: Vec::with_capacity(Self::EVENTS),
        };

        // The self-pipe stays level-triggered: a byte written by a remote
        // core keeps listen() waking until we drain it here.
        this.ctl(
            libc::EPOLL_CTL_ADD,
            this.wake_rx.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKE_TOKEN,
        )?;

        Ok(this)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: Token) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: token as u64,
        };
        // Safety: `ev` is a valid epoll_event and `self.epfd` is a live
        // epoll instance.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &raw mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn apply(&mut self, change: Change) {
        let result = match change {
            Change::Register { fd, token } => {
                // Registered disarmed; interests are armed on demand.
                self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLONESHOT as u32, token)
            }
            Change::Arm {
                fd,
                token,
                interest,
            } => {
                let mut events = libc::EPOLLONESHOT as u32 | libc::EPOLLRDHUP as u32;
                if interest.contains(Interest::INPUT) {
                    events |= libc::EPOLLIN as u32;
                }
                if interest.contains(Interest::OUTPUT) {
                    events |= libc::EPOLLOUT as u32;
                }
                self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
            }
            Change::Unregister { fd } => self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0),
        };

        if let Err(err) = result {
            // A close can race ahead of its buffered unregister; that is the
            // only benign failure here.
            tracing::debug!(?err, "epoll_ctl change failed");
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            // Safety: reading into a local buffer from an fd we own.
            let n = unsafe {
                libc::read(
                    self.wake_rx.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Backend for Epoll {
    fn listen(
        &mut self,
        changes: &mut Vec<Change>,
        events: &mut Vec<EventOut>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        for change in changes.drain(..) {
            self.apply(change);
        }

        let timeout_ms = match timeout {
            Some(timeout) => i32::try_from(timeout.as_millis().min(i32::MAX as u128))
                .expect("clamped to i32::MAX"),
            None => -1,
        };

        // Safety: the buffer pointer/capacity pair is valid for
        // `Self::EVENTS` entries; epoll_wait writes at most `maxevents`.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                i32::try_from(Self::EVENTS).expect("events buffer fits i32"),
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        // Safety: epoll_wait initialized the first `n` entries.
        unsafe {
            self.buf.set_len(usize::try_from(n).expect("n >= 0"));
        }

        for ev in &self.buf {
            #[expect(clippy::cast_possible_truncation, reason = "tokens are usize-sized")]
            let token = ev.u64 as Token;
            if token == WAKE_TOKEN {
                self.drain_wake_pipe();
                continue;
            }

            let mut readiness = Readiness::empty();
            let bits = ev.events;
            if bits & libc::EPOLLIN as u32 != 0 || bits & libc::EPOLLRDHUP as u32 != 0 {
                readiness |= Readiness::INPUT;
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                readiness |= Readiness::OUTPUT;
            }
            if bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                readiness |= Readiness::INPUT_ERROR | Readiness::OUTPUT_ERROR;
            }

            events.push(EventOut { token, readiness });
        }

        Ok(())
    }
}
