use crate::event::{Interest, IoSource};
use core::future::poll_fn;
use core::task::{Context, Poll, ready};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net as std_unix;
use std::path::Path;

/// A listening Unix-domain socket (the stub command channel).
#[derive(Debug)]
pub struct UnixListener {
    std: std_unix::UnixListener,
    src: IoSource,
}

// === impl UnixListener ===

impl UnixListener {
    /// Binds to `path`, removing a stale socket file first.
    ///
    /// # Errors
    ///
    /// Fails if binding fails or if called off the primary core.
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let std = std_unix::UnixListener::bind(path)?;
        std.set_nonblocking(true)?;
        let src = IoSource::new(std.as_raw_fd())?;
        Ok(Self { std, src })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        loop {
            match self.std.accept() {
                Ok((stream, _addr)) => return UnixStream::from_std(stream),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.src.clear_readiness(Interest::INPUT);
                    poll_fn(|cx| self.src.poll_readable(cx)).await;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

/// A connected Unix-domain stream.
#[derive(Debug)]
pub struct UnixStream {
    std: std_unix::UnixStream,
    src: IoSource,
}

// === impl UnixStream ===

impl UnixStream {
    pub fn from_std(std: std_unix::UnixStream) -> io::Result<Self> {
        std.set_nonblocking(true)?;
        let src = IoSource::new(std.as_raw_fd())?;
        Ok(Self { std, src })
    }

    pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            match (&self.std).read(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.src.clear_readiness(Interest::INPUT);
                    ready!(self.src.poll_readable(cx));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }

    pub fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            match (&self.std).write(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.src.clear_readiness(Interest::OUTPUT);
                    ready!(self.src.poll_writable(cx));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        poll_fn(|cx| self.poll_read(cx, buf)).await
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        poll_fn(|cx| self.poll_write(cx, buf)).await
    }
}
