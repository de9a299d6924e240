//! The sharded in-memory key/value storage engine.
//!
//! Keys are routed by FNV-1a hash to one of a power-of-two number of
//! partitions. Each partition is a chained hash table over a slot slab,
//! expanded in place by incremental striding and bounded by CLOCK eviction.
//! Access to a partition is serialized by one of three configurable
//! strategies (spinlock, delegation to the owning core, or flat combining);
//! see [`strategy::Strategy`].

mod action;
mod entry;
pub mod hash;
mod partition;
mod strategy;
mod table;

pub use entry::{EntryData, EntryRef, KEY_MAX};
pub use strategy::Strategy;
pub use table::{Config, IncrOutcome, StatsSnapshot, StoreOutcome, Table};

use core::fmt;

/// Storage failures surfaced to the protocol layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreError {
    /// The entry cannot fit the partition's volume budget, or allocation
    /// failed. Replied as `SERVER_ERROR out of memory storing object`; the
    /// table keeps serving.
    OutOfMemory,
    /// Key longer than [`KEY_MAX`].
    KeyTooLong,
    /// The owning core went away mid-operation (runtime shutdown).
    Shutdown,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::OutOfMemory => f.write_str("out of memory storing object"),
            StoreError::KeyTooLong => f.write_str("key too long"),
            StoreError::Shutdown => f.write_str("server shutting down"),
        }
    }
}

impl core::error::Error for StoreError {}
