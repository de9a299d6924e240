use crate::event::{Interest, IoSource};
use core::future::poll_fn;
use core::task::{Context, Poll, ready};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;

/// A listening TCP socket whose `accept` suspends the calling task.
#[derive(Debug)]
pub struct TcpListener {
    std: std::net::TcpListener,
    src: IoSource,
}

// === impl TcpListener ===

impl TcpListener {
    /// Binds and registers the listener with this core's event backend.
    ///
    /// # Errors
    ///
    /// Fails if binding fails or if called off the primary core.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let std = std::net::TcpListener::bind(addr)?;
        std.set_nonblocking(true)?;
        let src = IoSource::new(std.as_raw_fd())?;
        Ok(Self { std, src })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.std.local_addr()
    }

    /// Accepts one connection, suspending until a peer arrives.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            match self.std.accept() {
                Ok((stream, addr)) => {
                    let stream = TcpStream::from_std(stream)?;
                    return Ok((stream, addr));
                }
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

/// A connected TCP stream; reads and writes suspend on `WouldBlock` until
/// the event backend reports readiness.
#[derive(Debug)]
pub struct TcpStream {
    std: std::net::TcpStream,
    src: IoSource,
}

// === impl TcpStream ===

impl TcpStream {
    /// Wraps an accepted stream: nonblocking, Nagle off, registered with
    /// the event backend.
    pub fn from_std(std: std::net::TcpStream) -> io::Result<Self> {
        std.set_nonblocking(true)?;
        std.set_nodelay(true)?;
        let src = IoSource::new(std.as_raw_fd())?;
        Ok(Self { std, src })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.std.peer_addr()
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.std.shutdown(how)
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

    /// Reads into `buf`, suspending until at least one byte (or EOF/error)
    /// is available.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        poll_fn(|cx| self.poll_read(cx, buf)).await
    }

    /// Writes from `buf`, suspending until at least one byte was accepted.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        poll_fn(|cx| self.poll_write(cx, buf)).await
    }
}
