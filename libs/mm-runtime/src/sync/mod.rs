//! Blocking and waking primitives for cooperative tasks.

pub mod oneshot;
pub mod spin;
mod wait_cell;
mod wait_queue;

pub use wait_cell::WaitCell;
pub use wait_queue::{Wait, WaitQueue};
