//! kqueue backend (macOS and the BSDs).
//!
//! Read and write interest are separate kevent filters, armed `EV_ONESHOT`.
//! Changes are flushed in slices: if a batch of changes produces receipt
//! errors that fill the event array, the remainder is applied on the next
//! slice rather than being dropped.

use crate::event::{Backend, Change, EventOut, Interest, Readiness, Token, WAKE_TOKEN};
use core::time::Duration;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

pub(crate) struct Kqueue {
    kq: OwnedFd,
    wake_rx: OwnedFd,
    buf: Vec<libc::kevent>,
}

// === impl Kqueue ===

impl Kqueue {
    const EVENTS: usize = 256;
    /// Changes applied per kevent call.
    const CHANGE_SLICE: usize = 64;

    pub(crate) fn new(wake_rx: OwnedFd) -> io::Result<Self> {
        // Safety: plain syscall, result checked below.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: `kq` was just returned by kqueue().
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };

        let this = Self {
            kq,
            wake_rx,
            buf: Vec::with_capacity(Self::EVENTS),
        };

        // The self-pipe read end stays armed without EV_ONESHOT.
        let wake = kevent_change(
            this.wake_rx.as_raw_fd(),
            libc::EVFILT_READ,
            libc::EV_ADD,
            WAKE_TOKEN,
        );
        this.apply_slice(&[wake])?;

        Ok(this)
    }

    fn apply_slice(&self, changes: &[libc::kevent]) -> io::Result<()> {
        // Safety: the change list points at `changes`; a null eventlist with
        // zero size applies changes without draining events.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                i32::try_from(changes.len()).expect("change slice fits i32"),
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
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

#[expect(clippy::cast_sign_loss, reason = "fds handed to kqueue are non-negative")]
fn kevent_change(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    libc::kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: token as *mut libc::c_void,
    }
}

impl Backend for Kqueue {
    fn listen(
        &mut self,
        changes: &mut Vec<Change>,
        events: &mut Vec<EventOut>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let mut batch = Vec::with_capacity(Self::CHANGE_SLICE);
        for change in changes.drain(..) {
            match change {
                Change::Register { .. } => {
                    // kqueue has no disarmed registration; filters are added
                    // when first armed.
                }
                Change::Arm {
                    fd,
                    token,
                    interest,
                } => {
                    let flags = libc::EV_ADD | libc::EV_ONESHOT;
                    if interest.contains(Interest::INPUT) {
                        batch.push(kevent_change(fd, libc::EVFILT_READ, flags, token));
                    }
                    if interest.contains(Interest::OUTPUT) {
                        batch.push(kevent_change(fd, libc::EVFILT_WRITE, flags, token));
                    }
                }
                Change::Unregister { fd } => {
                    // Deleting a filter that is not present is fine; oneshot
                    // filters may already be gone.
                    batch.push(kevent_change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0));
                    batch.push(kevent_change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0));
                }
            }

            if batch.len() >= Self::CHANGE_SLICE {
                if let Err(err) = self.apply_slice(&batch) {
                    tracing::debug!(?err, "kevent change slice failed");
                }
                batch.clear();
            }
        }
        if !batch.is_empty()
            && let Err(err) = self.apply_slice(&batch)
        {
            tracing::debug!(?err, "kevent change slice failed");
        }

        let timespec = timeout.map(|timeout| libc::timespec {
            tv_sec: i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX),
            tv_nsec: i64::from(timeout.subsec_nanos()),
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(ptr::null(), |timespec| ptr::from_ref(timespec));

        // Safety: the buffer pointer/capacity pair is valid for
        // `Self::EVENTS` entries.
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.buf.as_mut_ptr(),
                i32::try_from(Self::EVENTS).expect("events buffer fits i32"),
                timespec_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        // Safety: kevent initialized the first `n` entries.
        unsafe {
            self.buf.set_len(usize::try_from(n).expect("n >= 0"));
        }

        for ev in &self.buf {
            let token = ev.udata as Token;
            if token == WAKE_TOKEN {
                self.drain_wake_pipe();
                continue;
            }

            let mut readiness = Readiness::empty();
            match ev.filter {
                libc::EVFILT_READ => readiness |= Readiness::INPUT,
                libc::EVFILT_WRITE => readiness |= Readiness::OUTPUT,
                _ => {}
            }
            if ev.flags & libc::EV_ERROR != 0 || ev.flags & libc::EV_EOF != 0 {
                readiness |= match ev.filter {
                    libc::EVFILT_WRITE => Readiness::OUTPUT_ERROR,
                    _ => Readiness::INPUT_ERROR,
                };
            }

            events.push(EventOut { token, readiness });
        }

        Ok(())
    }
}
