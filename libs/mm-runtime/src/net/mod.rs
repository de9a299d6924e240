//! Nonblocking sockets driven by the event backend.
//!
//! All socket I/O runs on the primary core (the one that owns the event
//! backend); constructing a listener or stream on any other core fails.
//! Reads and writes have no built-in deadline; wrap them in
//! [`time::timeout`](crate::time::timeout) to get one surfaced as a value.

mod tcp;
mod unix;

pub use tcp::{TcpListener, TcpStream};
pub use unix::{UnixListener, UnixStream};
