//! The memcache ASCII protocol layer: segmented connection buffers, the
//! streaming command parser, per-connection reader/writer task pairs, and
//! the accept loops.
//!
//! Per-connection ordering: replies are emitted in exactly the order
//! commands were parsed off the wire. Each parsed command claims a FIFO
//! slot before its processing first suspends; the writer encodes only the
//! completed prefix of that FIFO, so a slow (delegated) command holds back
//! everything behind it without reordering.

mod buffer;
mod command;
mod conn;
mod parser;
mod server;

pub use server::{serve, serve_cmd};
