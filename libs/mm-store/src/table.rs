//! The sharded table: key routing, the memcache-facing operations, CAS
//! stamping, background maintenance kicks, and stats.

use crate::action::{ActionKind, ActionOutcome};
use crate::entry::{EntryData, EntryRef};
use crate::hash::Route;
use crate::partition::{Hint, Partition, UpdateOutcome};
use crate::strategy::Strategy;
use crate::StoreError;
use mm_runtime::{Handle, Priority};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Table configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of partitions; rounded up to a power of two. `0` means "one
    /// per core".
    pub partitions: usize,
    /// Byte budget per partition; crossing it starts CLOCK eviction.
    pub volume: usize,
    pub strategy: Strategy,
    /// Initial bucket count per partition (power of two).
    pub nbuckets_min: usize,
    /// Bucket growth cap per partition (power of two).
    pub nbuckets_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partitions: 0,
            volume: 64 << 20,
            strategy: Strategy::default(),
            nbuckets_min: 1 << 10,
            nbuckets_max: 1 << 22,
        }
    }
}

/// Result of a storage-family command, in reply vocabulary.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreOutcome {
    /// `STORED`
    Stored,
    /// `NOT_STORED`
    NotStored,
    /// `EXISTS` (cas stamp mismatch)
    Exists,
    /// `NOT_FOUND`
    NotFound,
}

/// Result of `incr`/`decr`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IncrOutcome {
    /// The new numeric value.
    Value(u64),
    NotFound,
    /// The stored value is not an unsigned decimal number.
    NonNumeric,
}

/// Counters surfaced through the `stats` command.
#[derive(Debug, Default)]
struct Counters {
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    total_items: AtomicU64,
}

/// A point-in-time stats snapshot.
#[derive(Debug, Copy, Clone, Default)]
pub struct StatsSnapshot {
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub total_items: u64,
    pub curr_items: u64,
    pub bytes: u64,
    pub evictions: u64,
}

/// The sharded memcache table.
pub struct Table {
    parts: Vec<Arc<Partition>>,
    part_bits: u32,
    strategy: Strategy,
    /// CAS stamp source: monotonically increasing, fresh stamp per entry.
    stamp: AtomicU64,
    handle: Handle,
    counters: Counters,
    /// Back-reference for handing clones to spawned maintenance tasks.
    self_ref: Weak<Table>,
}

// === impl Table ===

impl Table {
    /// Builds the table over the runtime's cores: partition `i` is homed on
    /// core `i % cores`.
    pub fn new(config: Config, handle: Handle) -> Arc<Self> {
        let partitions = if config.partitions == 0 {
            handle.core_count()
        } else {
            config.partitions
        }
        .next_power_of_two();
        let part_bits = partitions.trailing_zeros();

        let per_part_volume = config.volume.max(1);
        let parts = (0..partitions)
            .map(|id| {
                let home = handle.core(id % handle.core_count()).clone();
                Arc::new(Partition::new(
                    id,
                    home,
                    config.nbuckets_min,
                    config.nbuckets_max,
                    per_part_volume,
                ))
            })
            .collect();

        tracing::info!(
            partitions,
            volume_per_partition = per_part_volume,
            strategy = ?config.strategy,
            "table built"
        );

        Arc::new_cyclic(|self_ref| Self {
            parts,
            part_bits,
            strategy: config.strategy,
            stamp: AtomicU64::new(0),
            handle,
            counters: Counters::default(),
            self_ref: self_ref.clone(),
        })
    }

    #[inline]
    fn route(&self, key: &[u8]) -> (&Arc<Partition>, u32) {
        let route = Route::new(key, self.part_bits);
        (&self.parts[route.part], route.hash)
    }

    /// Allocates a detached entry with a fresh CAS stamp; the caller fills
    /// the value and then inserts it. Dropping it is the `cancel` action.
    ///
    /// # Errors
    ///
    /// Fails for an oversized key.
    pub fn create_entry(
        &self,
        key: &[u8],
        value_len: usize,
        flags: u32,
        exptime: u32,
    ) -> Result<EntryData, StoreError> {
        let stamp = self.stamp.fetch_add(1, Ordering::Relaxed) + 1;
        EntryData::new(key, value_len, flags, exptime, stamp)
    }

    /// Looks up `key`, returning a counted reference on a hit.
    pub async fn get(&self, key: &[u8]) -> Option<EntryRef> {
        self.counters.cmd_get.fetch_add(1, Ordering::Relaxed);

        let found = self.lookup_raw(key).await;
        match found {
            Some(entry) => {
                self.counters.get_hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn lookup_raw(&self, key: &[u8]) -> Option<EntryRef> {
        let (part, hash) = self.route(key);
        let part = part.clone();
        let kind = ActionKind::Lookup { key: key.into() };

        let (result, hint) = self.strategy.run(&part, hash, kind).await;
        self.kick_maintenance(&part, hint);

        match result {
            Ok(ActionOutcome::Entry(found)) => {
                found.map(|entry| EntryRef::new(entry, part.home().clone()))
            }
            _ => None,
        }
    }

    /// `set`: unconditional store.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfMemory`] when the entry can never fit.
    pub async fn set(&self, entry: EntryData) -> Result<StoreOutcome, StoreError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let (part, hash) = self.route_owned(&entry);
        let kind = ActionKind::Upsert {
            entry: Arc::new(entry),
        };

        let (result, hint) = self.strategy.run(&part, hash, kind).await;
        self.kick_maintenance(&part, hint);

        match result? {
            ActionOutcome::Upserted(old) => {
                self.counters.total_items.fetch_add(1, Ordering::Relaxed);
                self.unref_on_home(&part, old);
                Ok(StoreOutcome::Stored)
            }
            outcome => unreachable!("upsert produced {outcome:?}"),
        }
    }

    /// `add`: store only if the key is absent.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfMemory`] when the entry can never fit.
    pub async fn add(&self, entry: EntryData) -> Result<StoreOutcome, StoreError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let (part, hash) = self.route_owned(&entry);
        let kind = ActionKind::Insert {
            entry: Arc::new(entry),
        };

        let (result, hint) = self.strategy.run(&part, hash, kind).await;
        self.kick_maintenance(&part, hint);

        match result? {
            ActionOutcome::Inserted { conflict: None } => {
                self.counters.total_items.fetch_add(1, Ordering::Relaxed);
                Ok(StoreOutcome::Stored)
            }
            ActionOutcome::Inserted { conflict: Some(existing) } => {
                self.unref_on_home(&part, Some(existing));
                Ok(StoreOutcome::NotStored)
            }
            outcome => unreachable!("insert produced {outcome:?}"),
        }
    }

    /// `replace`: store only if the key exists.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfMemory`] when the entry can never fit.
    pub async fn replace(&self, entry: EntryData) -> Result<StoreOutcome, StoreError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        match self.update_inner(entry, None).await? {
            UpdateDone::Replaced => Ok(StoreOutcome::Stored),
            UpdateDone::NotFound => Ok(StoreOutcome::NotStored),
            UpdateDone::Mismatch => unreachable!("replace does not match stamps"),
        }
    }

    /// `cas`: store only if the current entry's stamp equals `stamp`.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfMemory`] when the entry can never fit.
    pub async fn cas(
        &self,
        entry: EntryData,
        stamp: u64,
    ) -> Result<StoreOutcome, StoreError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        match self.update_inner(entry, Some(stamp)).await? {
            UpdateDone::Replaced => Ok(StoreOutcome::Stored),
            UpdateDone::Mismatch => Ok(StoreOutcome::Exists),
            UpdateDone::NotFound => Ok(StoreOutcome::NotFound),
        }
    }

    async fn update_inner(
        &self,
        entry: EntryData,
        match_stamp: Option<u64>,
    ) -> Result<UpdateDone, StoreError> {
        let (part, hash) = self.route_owned(&entry);
        let kind = ActionKind::Update {
            entry: Arc::new(entry),
            match_stamp,
        };

        let (result, hint) = self.strategy.run(&part, hash, kind).await;
        self.kick_maintenance(&part, hint);

        match result? {
            ActionOutcome::Updated(UpdateOutcome::Replaced(old)) => {
                self.counters.total_items.fetch_add(1, Ordering::Relaxed);
                // the displaced entry's table reference drops here (or is
                // shipped home)
                self.unref_on_home(&part, Some(old));
                Ok(UpdateDone::Replaced)
            }
            ActionOutcome::Updated(UpdateOutcome::Mismatch) => Ok(UpdateDone::Mismatch),
            ActionOutcome::Updated(UpdateOutcome::NotFound) => Ok(UpdateDone::NotFound),
            outcome => unreachable!("update produced {outcome:?}"),
        }
    }

    /// `append`/`prepend`: concatenate onto an existing value, atomically
    /// via a stamp-matched retry loop.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfMemory`] when the grown entry can never fit.
    pub async fn concat(
        &self,
        key: &[u8],
        bytes: &[u8],
        prepend: bool,
    ) -> Result<StoreOutcome, StoreError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);

        loop {
            let Some(old) = self.lookup_raw(key).await else {
                return Ok(StoreOutcome::NotStored);
            };

            let mut entry =
                self.create_entry(key, old.value_len() + bytes.len(), old.flags(), old.exptime())?;
            {
                let value = entry.value_mut();
                if prepend {
                    value[..bytes.len()].copy_from_slice(bytes);
                    value[bytes.len()..].copy_from_slice(old.value());
                } else {
                    value[..old.value_len()].copy_from_slice(old.value());
                    value[old.value_len()..].copy_from_slice(bytes);
                }
            }

            let stamp = old.stamp();
            drop(old);
            match self.update_inner(entry, Some(stamp)).await? {
                UpdateDone::Replaced => return Ok(StoreOutcome::Stored),
                UpdateDone::NotFound => return Ok(StoreOutcome::NotStored),
                // lost a race; re-read and retry
                UpdateDone::Mismatch => {}
            }
        }
    }

    /// `incr`/`decr`. Increment wraps at `u64::MAX`; decrement saturates
    /// at zero, as memcached does.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfMemory`] if the rewritten entry cannot be stored.
    pub async fn incr(
        &self,
        key: &[u8],
        delta: u64,
        decrement: bool,
    ) -> Result<IncrOutcome, StoreError> {
        loop {
            let Some(old) = self.lookup_raw(key).await else {
                return Ok(IncrOutcome::NotFound);
            };

            let Some(current) = parse_decimal(old.value()) else {
                return Ok(IncrOutcome::NonNumeric);
            };
            let new = if decrement {
                current.saturating_sub(delta)
            } else {
                current.wrapping_add(delta)
            };

            let text = new.to_string();
            let mut entry = self.create_entry(key, text.len(), old.flags(), old.exptime())?;
            entry.value_mut().copy_from_slice(text.as_bytes());

            let stamp = old.stamp();
            drop(old);
            match self.update_inner(entry, Some(stamp)).await? {
                UpdateDone::Replaced => return Ok(IncrOutcome::Value(new)),
                UpdateDone::NotFound => return Ok(IncrOutcome::NotFound),
                UpdateDone::Mismatch => {}
            }
        }
    }

    /// `delete`.
    pub async fn delete(&self, key: &[u8]) -> bool {
        let (part, hash) = self.route(key);
        let part = part.clone();
        let kind = ActionKind::Delete { key: key.into() };

        let (result, hint) = self.strategy.run(&part, hash, kind).await;
        self.kick_maintenance(&part, hint);

        match result {
            Ok(ActionOutcome::Entry(removed)) => {
                let hit = removed.is_some();
                self.unref_on_home(&part, removed);
                hit
            }
            _ => false,
        }
    }

    /// `flush_all`: removes every entry in every partition.
    ///
    /// The flush action only unlinks; the references come back here and are
    /// released through [`unref_on_home`](Self::unref_on_home), so entries
    /// of a partition homed on another core travel through that core's
    /// chunk ring instead of being dropped on whichever core ran the flush.
    pub async fn flush_all(&self) {
        for part in self.parts.clone() {
            let (result, _) = self.strategy.run(&part, 0, ActionKind::Flush).await;
            if let Ok(ActionOutcome::Flushed { removed }) = result {
                tracing::debug!(partition = part.id(), removed = removed.len(), "flushed");
                for entry in removed {
                    self.unref_on_home(&part, Some(entry));
                }
            }
        }
    }

    /// Point-in-time counters for the `stats` command.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot {
            cmd_get: self.counters.cmd_get.load(Ordering::Relaxed),
            cmd_set: self.counters.cmd_set.load(Ordering::Relaxed),
            get_hits: self.counters.get_hits.load(Ordering::Relaxed),
            get_misses: self.counters.get_misses.load(Ordering::Relaxed),
            total_items: self.counters.total_items.load(Ordering::Relaxed),
            ..StatsSnapshot::default()
        };

        for part in &self.parts {
            let core = part.core.lock();
            snapshot.curr_items += core.nentries() as u64;
            snapshot.bytes += core.volume() as u64;
            snapshot.evictions += core.evictions;
        }
        snapshot
    }

    pub fn partition_count(&self) -> usize {
        self.parts.len()
    }

    fn route_owned(&self, entry: &EntryData) -> (Arc<Partition>, u32) {
        let (part, hash) = self.route(entry.key());
        (part.clone(), hash)
    }

    /// Drops a displaced table reference, deferring to the partition's home
    /// core when dropped elsewhere.
    fn unref_on_home(&self, part: &Arc<Partition>, entry: Option<Arc<EntryData>>) {
        if let Some(entry) = entry {
            drop(EntryRef::new(entry, part.home().clone()));
        }
    }

    /// Spawns the background loops a mutation asked for, on the partition's
    /// owning core, at idle priority.
    fn kick_maintenance(&self, part: &Arc<Partition>, hint: Hint) {
        if hint.stride {
            self.spawn_maintenance(part, MaintKind::Stride);
        }
        if hint.evict {
            self.spawn_maintenance(part, MaintKind::Evict);
        }
    }

    fn spawn_maintenance(&self, part: &Arc<Partition>, kind: MaintKind) {
        let Some(table) = self.self_ref.upgrade() else {
            return;
        };
        let part = part.clone();
        let name = match kind {
            MaintKind::Stride => "stride",
            MaintKind::Evict => "evict",
        };

        tracing::debug!(partition = part.id(), kind = name, "maintenance kicked");
        self.handle.spawn_on(
            part.home().id(),
            async move {
                loop {
                    let action = match kind {
                        MaintKind::Stride => ActionKind::Stride,
                        MaintKind::Evict => ActionKind::Evict,
                    };
                    let (result, _) = table.strategy.run(&part, 0, action).await;
                    match result {
                        Ok(ActionOutcome::Maintenance { more: true }) => {
                            mm_runtime::yield_now().await;
                        }
                        _ => break,
                    }
                }
            },
            Priority::Idle,
            name,
        );
    }

}

/// `update_inner`'s outcome with the displaced entry already unreffed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum UpdateDone {
    Replaced,
    Mismatch,
    NotFound,
}

fn parse_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    let mut value: u64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(byte - b'0'))?;
    }
    Some(value)
}

#[derive(Copy, Clone)]
enum MaintKind {
    Stride,
    Evict,
}
