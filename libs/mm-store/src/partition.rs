//! One shard of the table: bucket array, entry slots, incremental striding
//! expand, and CLOCK eviction.
//!
//! The bucket array is reserved at its maximum size up front and grown in
//! place by extending the initialized length, so growth never reallocates or
//! moves it. Entries live in a slot slab chained by index; a slot index, not
//! a pointer, is what buckets and free lists store.
//!
//! Everything in [`PartitionCore`] is guarded by the partition's spin task
//! lock. Which cores actually contend on it depends on the configured
//! serialization strategy: under `Lock` any core may take it, under
//! `Delegate` only the owning core touches it, and under `Combine` the
//! winning combiner does.

use crate::entry::EntryData;
use crate::strategy::CombineQueue;
use mm_runtime::CoreHandle;
use mm_runtime::sync::spin;
use std::sync::Arc;

/// Chain terminator / "no slot".
const NIL: u32 = u32::MAX;

/// Buckets re-bucketized per stride step.
const STRIDE: usize = 64;

/// Slots examined per eviction step before the loop yields.
const CLOCK_BUDGET: usize = 64;

/// A shard of the table.
pub struct Partition {
    id: usize,
    /// The core that runs this partition's maintenance and reclaims its
    /// cross-core frees.
    home: Arc<CoreHandle>,
    pub(crate) core: spin::Mutex<PartitionCore>,
    pub(crate) combiner: CombineQueue,
}

// === impl Partition ===

impl Partition {
    pub(crate) fn new(
        id: usize,
        home: Arc<CoreHandle>,
        nbuckets_min: usize,
        nbuckets_max: usize,
        volume_max: usize,
    ) -> Self {
        Self {
            id,
            home,
            core: spin::Mutex::new(PartitionCore::new(nbuckets_min, nbuckets_max, volume_max)),
            combiner: CombineQueue::new(1024),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn home(&self) -> &Arc<CoreHandle> {
        &self.home
    }
}

/// One slot of the partition's entry slab.
#[derive(Debug)]
struct Slot {
    /// Next slot in the bucket chain, or in the free list.
    next: u32,
    /// Bucket-placement hash bits of the entry, kept here so striding can
    /// re-bucketize chains without rehashing keys.
    hash: u32,
    /// CLOCK second-chance bit; set on lookup, cleared by the hand.
    used_recently: bool,
    entry: Option<Arc<EntryData>>,
}

/// The guarded innards of a partition.
#[derive(Debug)]
pub(crate) struct PartitionCore {
    /// Head slot index per bucket. `len()` is the allocated (power-of-two)
    /// size; `used` is the striding watermark of enabled buckets.
    buckets: Vec<u32>,
    /// Enabled bucket count; in `[size/2, size]` while striding, `== size`
    /// otherwise.
    used: usize,
    slots: Vec<Slot>,
    free_head: u32,
    nentries: usize,
    /// Bytes held by live entries.
    volume: usize,
    clock_hand: usize,
    striding: bool,
    evicting: bool,
    nbuckets_max: usize,
    volume_max: usize,
    /// Eviction hysteresis: start when `volume + reserve > volume_max`,
    /// stop when back under `volume_max - reserve`.
    reserve: usize,
    /// Entries removed by the CLOCK hand since startup.
    pub(crate) evictions: u64,
}

/// What an action left behind that the caller should schedule.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Hint {
    pub(crate) stride: bool,
    pub(crate) evict: bool,
}

/// Outcome of an update (`replace` / `cas`).
#[derive(Debug)]
pub(crate) enum UpdateOutcome {
    /// The entry was swapped in; the previous entry is handed back for the
    /// caller to unref.
    Replaced(Arc<EntryData>),
    /// A `match_stamp` was given and the current entry's stamp differs.
    Mismatch,
    NotFound,
}

// === impl PartitionCore ===

impl PartitionCore {
    fn new(nbuckets_min: usize, nbuckets_max: usize, volume_max: usize) -> Self {
        assert!(nbuckets_min.is_power_of_two());
        assert!(nbuckets_max.is_power_of_two());
        assert!(nbuckets_min <= nbuckets_max);

        let mut buckets = Vec::with_capacity(nbuckets_max);
        buckets.resize(nbuckets_min, NIL);

        Self {
            used: nbuckets_min,
            buckets,
            slots: Vec::new(),
            free_head: NIL,
            nentries: 0,
            volume: 0,
            clock_hand: 0,
            striding: false,
            evicting: false,
            nbuckets_max,
            volume_max,
            reserve: (volume_max / 16).max(1),
            evictions: 0,
        }
    }

    #[inline]
    pub(crate) fn nentries(&self) -> usize {
        self.nentries
    }

    #[inline]
    pub(crate) fn nbuckets(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn volume(&self) -> usize {
        self.volume
    }

    /// The bucket a hash maps to under the current striding watermark:
    /// `h & (size-1)` if that bucket is enabled, else folded back under the
    /// half-size mask.
    fn bucket_of(&self, hash: u32) -> usize {
        let mask = self.buckets.len() - 1;
        let mut idx = hash as usize & mask;
        if idx >= self.used {
            idx = hash as usize & (mask >> 1);
        }
        idx
    }

    /// Finds the slot holding `key`, returning `(prev, slot)` chain indices.
    fn find(&self, hash: u32, key: &[u8]) -> Option<(u32, u32)> {
        let bucket = self.bucket_of(hash);
        let mut prev = NIL;
        let mut cur = self.buckets[bucket];

        while cur != NIL {
            let slot = &self.slots[cur as usize];
            if slot.hash == hash
                && slot
                    .entry
                    .as_ref()
                    .is_some_and(|entry| entry.key() == key)
            {
                return Some((prev, cur));
            }
            prev = cur;
            cur = slot.next;
        }
        None
    }

    /// Looks `key` up, marking the entry recently used on a hit.
    pub(crate) fn lookup(&mut self, hash: u32, key: &[u8]) -> Option<Arc<EntryData>> {
        let (_, idx) = self.find(hash, key)?;
        let slot = &mut self.slots[idx as usize];
        slot.used_recently = true;
        slot.entry.clone()
    }

    /// Inserts a detached entry. The caller has ruled out an existing match
    /// (or explicitly wants a duplicate-tolerant insert after a remove).
    pub(crate) fn insert(&mut self, hash: u32, entry: Arc<EntryData>) {
        let bucket = self.bucket_of(hash);
        let volume = entry.volume();

        let idx = self.alloc_slot();
        let slot = &mut self.slots[idx as usize];
        slot.next = self.buckets[bucket];
        slot.hash = hash;
        slot.used_recently = true;
        slot.entry = Some(entry);

        self.buckets[bucket] = idx;
        self.nentries += 1;
        self.volume += volume;
    }

    /// Removes `key`, handing the table's reference back to the caller.
    pub(crate) fn remove(&mut self, hash: u32, key: &[u8]) -> Option<Arc<EntryData>> {
        let (prev, idx) = self.find(hash, key)?;
        Some(self.unlink(self.bucket_of(hash), prev, idx))
    }

    /// Replaces the entry under `key`, optionally only when the current
    /// stamp matches (`cas`).
    pub(crate) fn update(
        &mut self,
        hash: u32,
        entry: Arc<EntryData>,
        match_stamp: Option<u64>,
    ) -> UpdateOutcome {
        let Some((_, idx)) = self.find(hash, entry.key()) else {
            return UpdateOutcome::NotFound;
        };

        let slot = &mut self.slots[idx as usize];
        let old = slot.entry.as_ref().expect("linked slot without entry");

        if let Some(stamp) = match_stamp
            && old.stamp() != stamp
        {
            return UpdateOutcome::Mismatch;
        }

        let new_volume = entry.volume();
        let old = slot.entry.replace(entry).expect("linked slot without entry");
        slot.used_recently = true;
        self.volume += new_volume;
        self.volume -= old.volume();
        UpdateOutcome::Replaced(old)
    }

    /// Inserts unless the key is already present; on conflict the existing
    /// entry is handed back (reffed) and nothing changes.
    pub(crate) fn insert_unique(
        &mut self,
        hash: u32,
        entry: Arc<EntryData>,
    ) -> Option<Arc<EntryData>> {
        if let Some((_, idx)) = self.find(hash, entry.key()) {
            return self.slots[idx as usize].entry.clone();
        }
        self.insert(hash, entry);
        None
    }

    /// Inserts or replaces; the previous entry, if any, is handed back.
    pub(crate) fn upsert(&mut self, hash: u32, entry: Arc<EntryData>) -> Option<Arc<EntryData>> {
        match self.update(hash, entry.clone(), None) {
            UpdateOutcome::Replaced(old) => Some(old),
            UpdateOutcome::NotFound => {
                self.insert(hash, entry);
                None
            }
            UpdateOutcome::Mismatch => unreachable!("update without stamp cannot mismatch"),
        }
    }

    /// Removes every entry (`flush_all`), handing the table's references
    /// back to the caller. Nothing is freed here: the caller routes each
    /// reference through its home-core unref path, since a flush may be
    /// executing on a core that does not own this partition. Bucket sizing
    /// survives.
    pub(crate) fn flush(&mut self) -> Vec<Arc<EntryData>> {
        let mut removed = Vec::with_capacity(self.nentries);

        for bucket in &mut self.buckets {
            *bucket = NIL;
        }
        let slot_count = self.slots.len();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                removed.push(entry);
            }
            slot.used_recently = false;
            slot.next = if i + 1 < slot_count {
                u32::try_from(i + 1).expect("slot index fits u32")
            } else {
                NIL
            };
        }
        self.free_head = if self.slots.is_empty() { NIL } else { 0 };
        self.nentries = 0;
        self.volume = 0;
        self.clock_hand = 0;
        removed
    }

    /// Sets the striding flag if expansion is warranted and not already
    /// running. Returns whether the caller should kick the stride loop.
    pub(crate) fn start_stride(&mut self) -> bool {
        if !self.striding
            && self.nentries > 2 * self.buckets.len()
            && self.buckets.len() < self.nbuckets_max
        {
            self.striding = true;
            return true;
        }
        false
    }

    /// Sets the evicting flag if the volume watermark was crossed. Returns
    /// whether the caller should kick the eviction loop.
    pub(crate) fn start_evict(&mut self) -> bool {
        if !self.evicting && self.volume + self.reserve > self.volume_max {
            self.evicting = true;
            return true;
        }
        false
    }

    /// One stride step: double the bucket area in place when every bucket is
    /// enabled, then split up to [`STRIDE`] chains across the larger mask.
    /// Returns `true` while more striding is needed.
    pub(crate) fn stride(&mut self) -> bool {
        debug_assert!(self.striding);

        let mut size = self.buckets.len();
        if self.used == size {
            if size >= self.nbuckets_max {
                self.striding = false;
                return false;
            }
            // Enable the next doubling; the watermark stays at the old size
            // so lookups keep folding not-yet-split buckets.
            size *= 2;
            self.buckets.resize(size, NIL);
        }

        let half = size / 2;
        let mask = size - 1;
        for _ in 0..STRIDE {
            if self.used == size {
                break;
            }
            let target = self.used;
            let source = target - half;

            // Split the chain at `source`: entries whose hash lands on
            // `target` under the new mask move over, the rest stay. Chains
            // are rebuilt in reverse; order within a bucket is immaterial.
            let mut keep = NIL;
            let mut moved = NIL;
            let mut cur = self.buckets[source];
            while cur != NIL {
                let next = self.slots[cur as usize].next;
                let idx = self.slots[cur as usize].hash as usize & mask;
                debug_assert!(idx == source || idx == target);
                if idx == target {
                    self.slots[cur as usize].next = moved;
                    moved = cur;
                } else {
                    self.slots[cur as usize].next = keep;
                    keep = cur;
                }
                cur = next;
            }
            self.buckets[source] = keep;
            self.buckets[target] = moved;
            self.used += 1;
        }

        if self.used < size {
            return true;
        }
        // fully split; is another round of doubling already warranted?
        if self.nentries > 2 * self.buckets.len() && self.buckets.len() < self.nbuckets_max {
            true
        } else {
            self.striding = false;
            false
        }
    }

    /// One CLOCK pass of at most [`CLOCK_BUDGET`] slots: recently used
    /// entries lose their second chance, others are unlinked and unreffed.
    /// Returns `true` while the volume is still above the low watermark.
    pub(crate) fn evict(&mut self) -> bool {
        debug_assert!(self.evicting);

        let mut budget = CLOCK_BUDGET;
        while self.volume + self.reserve > self.volume_max && self.nentries > 0 && budget > 0 {
            budget -= 1;

            let idx = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % self.slots.len();

            let hash = {
                let slot = &mut self.slots[idx];
                if slot.entry.is_none() {
                    continue;
                }
                if slot.used_recently {
                    slot.used_recently = false;
                    continue;
                }
                slot.hash
            };

            let bucket = self.bucket_of(hash);
            let slot = u32::try_from(idx).expect("slot index fits u32");
            let (prev, found) = self.chain_position(bucket, slot);
            debug_assert!(found, "clock hand met an unlinked slot");
            let removed = self.unlink(bucket, prev, slot);
            self.evictions += 1;
            drop(removed);
        }

        if self.volume + self.reserve > self.volume_max && self.nentries > 0 {
            true
        } else {
            self.evicting = false;
            false
        }
    }

    /// Locates `slot` within `bucket`'s chain, returning its predecessor.
    fn chain_position(&self, bucket: usize, slot: u32) -> (u32, bool) {
        let mut prev = NIL;
        let mut cur = self.buckets[bucket];
        while cur != NIL {
            if cur == slot {
                return (prev, true);
            }
            prev = cur;
            cur = self.slots[cur as usize].next;
        }
        (NIL, false)
    }

    /// Unlinks a slot from its chain and frees it, handing the entry back.
    fn unlink(&mut self, bucket: usize, prev: u32, idx: u32) -> Arc<EntryData> {
        let next = self.slots[idx as usize].next;
        if prev == NIL {
            self.buckets[bucket] = next;
        } else {
            self.slots[prev as usize].next = next;
        }

        let slot = &mut self.slots[idx as usize];
        let entry = slot.entry.take().expect("unlinking an empty slot");
        slot.used_recently = false;
        slot.next = self.free_head;
        self.free_head = idx;

        self.nentries -= 1;
        self.volume -= entry.volume();
        entry
    }

    fn alloc_slot(&mut self) -> u32 {
        if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.slots[idx as usize].next;
            return idx;
        }

        let idx = u32::try_from(self.slots.len()).expect("slot count fits u32");
        self.slots.push(Slot {
            next: NIL,
            hash: 0,
            used_recently: false,
            entry: None,
        });
        idx
    }

    /// Whether a detached entry of this size can ever be stored.
    pub(crate) fn admits(&self, volume: usize) -> bool {
        volume <= self.volume_max
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let size = self.buckets.len();
        assert!(size.is_power_of_two());
        assert!(self.used <= size);
        assert!(self.used >= size / 2);

        // every linked entry is findable under the placement rule, and the
        // linked count matches `nentries`
        let mut linked = 0;
        let mut volume = 0;
        for (bucket, &head) in self.buckets.iter().enumerate() {
            let mut cur = head;
            while cur != NIL {
                let slot = &self.slots[cur as usize];
                let entry = slot.entry.as_ref().expect("linked slot without entry");
                assert_eq!(self.bucket_of(slot.hash), bucket);
                linked += 1;
                volume += entry.volume();
                cur = slot.next;
            }
        }
        assert_eq!(linked, self.nentries);
        assert_eq!(volume, self.volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &[u8], value: &[u8], stamp: u64) -> Arc<EntryData> {
        let mut entry = EntryData::new(key, value.len(), 0, 0, stamp).unwrap();
        entry.value_mut().copy_from_slice(value);
        Arc::new(entry)
    }

    fn hash_of(key: &[u8]) -> u32 {
        crate::hash::fnv1a(key)
    }

    fn core() -> PartitionCore {
        PartitionCore::new(4, 1 << 16, 1 << 20)
    }

    #[test]
    fn insert_lookup_remove_roundtrip() {
        let mut core = core();
        let h = hash_of(b"k");

        core.insert(h, entry(b"k", b"value", 1));
        core.check_invariants();

        let found = core.lookup(h, b"k").unwrap();
        assert_eq!(found.value(), b"value");

        assert!(core.lookup(h, b"other").is_none());

        let removed = core.remove(h, b"k").unwrap();
        assert_eq!(removed.value(), b"value");
        assert_eq!(core.nentries(), 0);
        assert!(core.remove(h, b"k").is_none());
        core.check_invariants();
    }

    #[test]
    fn update_with_stamp_mismatch_keeps_old_entry() {
        let mut core = core();
        let h = hash_of(b"k");

        core.insert(h, entry(b"k", b"old", 5));

        let outcome = core.update(h, entry(b"k", b"new", 6), Some(4));
        assert!(matches!(outcome, UpdateOutcome::Mismatch));
        assert_eq!(core.lookup(h, b"k").unwrap().value(), b"old");

        let outcome = core.update(h, entry(b"k", b"new", 6), Some(5));
        assert!(matches!(outcome, UpdateOutcome::Replaced(_)));
        assert_eq!(core.lookup(h, b"k").unwrap().value(), b"new");
        core.check_invariants();
    }

    #[test]
    fn striding_expand_preserves_every_key() {
        let mut core = PartitionCore::new(4, 1 << 16, usize::MAX);
        let n = 10_000u32;

        for i in 0..n {
            let key = format!("key-{i}");
            let h = hash_of(key.as_bytes());
            core.insert(h, entry(key.as_bytes(), b"v", u64::from(i)));

            if core.start_stride() {
                // drive the incremental expand to completion, checking the
                // placement invariant at every step
                while core.stride() {
                    core.check_invariants();
                }
                core.check_invariants();
            }
        }

        assert!(core.nbuckets() > 4);
        assert!(core.nbuckets().is_power_of_two());

        for i in 0..n {
            let key = format!("key-{i}");
            let h = hash_of(key.as_bytes());
            let found = core.lookup(h, key.as_bytes());
            assert!(found.is_some(), "lost key-{i} after striding");
        }
    }

    #[test]
    fn clock_eviction_brings_volume_down() {
        // volume_max 4 KiB, values 128 B: ~30 entries fit
        let mut core = PartitionCore::new(4, 1 << 16, 4096);

        for i in 0..64u32 {
            let key = format!("key-{i}");
            let h = hash_of(key.as_bytes());
            core.insert(h, entry(key.as_bytes(), &[0u8; 128], u64::from(i)));

            if core.start_evict() {
                while core.evict() {}
            }
        }

        assert!(core.volume() + core.reserve <= core.volume_max);
        assert!(core.nentries() > 0, "eviction should not empty the table");
        core.check_invariants();
    }

    #[test]
    fn second_chance_spares_recently_used_entries() {
        // Fixed-size entries: 7-byte key + 121-byte value = 128 bytes, with
        // volume_max 4096 and reserve 256, so eviction starts past 3840
        // bytes and stops at 3840.
        let mut core = PartitionCore::new(64, 1 << 16, 4096);
        let key = |i: u32| format!("key-{i:03}");
        let put = |core: &mut PartitionCore, i: u32| {
            let key = key(i);
            core.insert(
                hash_of(key.as_bytes()),
                entry(key.as_bytes(), &[0u8; 121], u64::from(i)),
            );
        };

        // First round of pressure: every entry still carries its insert-time
        // second chance, so the hand's first lap only clears bits and the
        // removals start from the hand's wrap-around.
        for i in 0..31 {
            put(&mut core, i);
        }
        assert!(core.start_evict());
        while core.evict() {}
        core.check_invariants();

        // The survivors' bits were cleared by the lap above. Touch one.
        assert!(core.lookup(hash_of(b"key-010"), b"key-010").is_some());

        // Second round of pressure: the untouched survivors ahead of the
        // hand go first; the touched key keeps its second chance.
        put(&mut core, 31);
        put(&mut core, 32);
        assert!(core.start_evict());
        while core.evict() {}
        core.check_invariants();

        assert!(
            core.lookup(hash_of(b"key-010"), b"key-010").is_some(),
            "recently used entry lost its second chance too early"
        );
        assert!(
            core.lookup(hash_of(b"key-001"), b"key-001").is_none(),
            "the hand should have taken the untouched entry right after it"
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        #[derive(Debug, Clone)]
        enum Step {
            Insert(u8, u8),
            Remove(u8),
            Lookup(u8),
            Stride,
            Evict,
        }

        fn step() -> impl proptest::strategy::Strategy<Value = Step> {
            prop_oneof![
                (any::<u8>(), any::<u8>()).prop_map(|(k, v)| Step::Insert(k, v)),
                any::<u8>().prop_map(Step::Remove),
                any::<u8>().prop_map(Step::Lookup),
                Just(Step::Stride),
                Just(Step::Evict),
            ]
        }

        proptest! {
            /// The partition agrees with a model map under arbitrary
            /// interleavings of mutations and maintenance, and its internal
            /// invariants hold after every step.
            #[test]
            fn behaves_like_a_map(steps in proptest::collection::vec(step(), 1..200)) {
                let mut core = PartitionCore::new(4, 1 << 10, usize::MAX);
                let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
                let mut stamp = 0u64;

                for op in steps {
                    match op {
                        Step::Insert(k, v) => {
                            let key = vec![b'k', k];
                            let value = vec![v; usize::from(v % 16) + 1];
                            stamp += 1;
                            let h = hash_of(&key);
                            core.upsert(h, entry(&key, &value, stamp));
                            model.insert(key, value);
                        }
                        Step::Remove(k) => {
                            let key = vec![b'k', k];
                            let h = hash_of(&key);
                            prop_assert_eq!(
                                core.remove(h, &key).is_some(),
                                model.remove(&key).is_some()
                            );
                        }
                        Step::Lookup(k) => {
                            let key = vec![b'k', k];
                            let h = hash_of(&key);
                            let got = core.lookup(h, &key);
                            match model.get(&key) {
                                Some(value) => {
                                    let got = got.expect("model has the key");
                                    prop_assert_eq!(got.value(), &value[..]);
                                }
                                None => prop_assert!(got.is_none()),
                            }
                        }
                        Step::Stride => {
                            if core.start_stride() {
                                core.stride();
                            } else if core.striding {
                                core.stride();
                            }
                        }
                        Step::Evict => {
                            if core.start_evict() {
                                core.evict();
                            }
                        }
                    }
                    core.check_invariants();
                }

                prop_assert_eq!(core.nentries(), model.len());
            }
        }
    }

    #[test]
    fn flush_empties_and_slots_are_reusable() {
        let mut core = core();
        for i in 0..100u32 {
            let key = format!("key-{i}");
            core.insert(hash_of(key.as_bytes()), entry(key.as_bytes(), b"v", u64::from(i)));
        }

        assert_eq!(core.flush().len(), 100);
        assert_eq!(core.nentries(), 0);
        assert_eq!(core.volume(), 0);
        core.check_invariants();

        core.insert(hash_of(b"again"), entry(b"again", b"v", 1000));
        assert!(core.lookup(hash_of(b"again"), b"again").is_some());
        core.check_invariants();
    }
}
