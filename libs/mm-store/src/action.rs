//! The fixed set of operations a partition accepts, and their application
//! under the partition lock.
//!
//! An action is routed to its partition by the key's [`Route`](crate::hash::Route)
//! and executed through one of the serialization strategies in
//! [`strategy`](crate::strategy). Creating a detached entry and cancelling or
//! finishing one need no action here: a detached entry touches no partition
//! state until `insert`, and releasing one is just a drop (of the entry, or
//! of an [`EntryRef`](crate::entry::EntryRef)).

use crate::StoreError;
use crate::entry::EntryData;
use crate::partition::{Hint, Partition, PartitionCore, UpdateOutcome};
use std::sync::Arc;

/// An operation against one partition.
#[derive(Debug)]
pub(crate) enum ActionKind {
    Lookup { key: Box<[u8]> },
    Delete { key: Box<[u8]> },
    /// Insert-if-absent: the presence check runs under the same lock hold,
    /// so `add` is a single linearized action.
    Insert { entry: Arc<EntryData> },
    Update {
        entry: Arc<EntryData>,
        match_stamp: Option<u64>,
    },
    Upsert { entry: Arc<EntryData> },
    Stride,
    Evict,
    Flush,
}

/// What an action produced.
#[derive(Debug)]
pub(crate) enum ActionOutcome {
    /// `lookup` / `delete`: the matched entry, reffed for the caller.
    Entry(Option<Arc<EntryData>>),
    /// `insert`: the conflicting entry when the key already existed.
    Inserted { conflict: Option<Arc<EntryData>> },
    /// `update`: replaced / stamp mismatch / no such key.
    Updated(UpdateOutcome),
    /// `upsert`: the displaced entry, if any.
    Upserted(Option<Arc<EntryData>>),
    /// `stride` / `evict`: whether another step is needed.
    Maintenance { more: bool },
    /// `flush`: every removed entry, reffed for the caller to release on
    /// the partition's home core.
    Flushed { removed: Vec<Arc<EntryData>> },
}

pub(crate) type ActionResult = (Result<ActionOutcome, StoreError>, Hint);

/// Applies `kind` to a locked partition. This is the single place that
/// mutates partition state; every strategy funnels through it.
pub(crate) fn apply(core: &mut PartitionCore, hash: u32, kind: ActionKind) -> ActionResult {
    let result = match kind {
        ActionKind::Lookup { key } => Ok(ActionOutcome::Entry(core.lookup(hash, &key))),
        ActionKind::Delete { key } => Ok(ActionOutcome::Entry(core.remove(hash, &key))),
        ActionKind::Insert { entry } => {
            if !core.admits(entry.volume()) {
                Err(StoreError::OutOfMemory)
            } else {
                Ok(ActionOutcome::Inserted {
                    conflict: core.insert_unique(hash, entry),
                })
            }
        }
        ActionKind::Update { entry, match_stamp } => {
            if !core.admits(entry.volume()) {
                Err(StoreError::OutOfMemory)
            } else {
                Ok(ActionOutcome::Updated(core.update(hash, entry, match_stamp)))
            }
        }
        ActionKind::Upsert { entry } => {
            if !core.admits(entry.volume()) {
                Err(StoreError::OutOfMemory)
            } else {
                Ok(ActionOutcome::Upserted(core.upsert(hash, entry)))
            }
        }
        ActionKind::Stride => Ok(ActionOutcome::Maintenance { more: core.stride() }),
        ActionKind::Evict => Ok(ActionOutcome::Maintenance { more: core.evict() }),
        ActionKind::Flush => Ok(ActionOutcome::Flushed {
            removed: core.flush(),
        }),
    };

    // Mutating actions may have pushed the partition over a watermark; the
    // caller schedules the background loops this asks for.
    let hint = Hint {
        stride: core.start_stride(),
        evict: core.start_evict(),
    };

    (result, hint)
}

// === impl Partition ===

impl Partition {
    /// Takes the partition's task lock and applies the action in place.
    pub(crate) fn apply_locked(&self, hash: u32, kind: ActionKind) -> ActionResult {
        let mut core = self.core.lock();
        apply(&mut core, hash, kind)
    }
}
