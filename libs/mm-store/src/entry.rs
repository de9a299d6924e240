//! Cache entries and reference counting.
//!
//! An entry's payload (key and value bytes, flags, CAS stamp) is immutable
//! once inserted and shared by reference count: the partition table holds
//! one reference, every in-flight command result holds one, and every
//! transmit splice holds one until its bytes hit the socket. The entry is
//! freed when the last reference drops.
//!
//! References dropped on a core other than the partition's owning core are
//! not freed in place: the reference is shipped home through the owning
//! core's chunk ring and dropped there, keeping each core's free traffic
//! local to it.

use crate::StoreError;
use core::fmt;
use core::ops::Deref;
use std::sync::Arc;
use mm_runtime::CoreHandle;

/// Longest accepted key, per the memcache text protocol.
pub const KEY_MAX: usize = 250;

/// The immutable payload of a cache entry.
pub struct EntryData {
    key_len: u16,
    flags: u32,
    /// Parsed and recorded, but entries never expire on their own; only
    /// `flush_all` invalidates.
    exptime: u32,
    stamp: u64,
    /// Key bytes followed by value bytes.
    data: Box<[u8]>,
}

// === impl EntryData ===

impl EntryData {
    /// Allocates an entry with a zeroed value area for the caller to fill.
    ///
    /// # Errors
    ///
    /// Fails if the key is over [`KEY_MAX`] bytes.
    pub fn new(
        key: &[u8],
        value_len: usize,
        flags: u32,
        exptime: u32,
        stamp: u64,
    ) -> Result<Self, StoreError> {
        if key.len() > KEY_MAX {
            return Err(StoreError::KeyTooLong);
        }

        let mut data = vec![0u8; key.len() + value_len].into_boxed_slice();
        data[..key.len()].copy_from_slice(key);

        Ok(Self {
            key_len: u16::try_from(key.len()).expect("key fits u16 after KEY_MAX check"),
            flags,
            exptime,
            stamp,
            data,
        })
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.data[..usize::from(self.key_len)]
    }

    #[inline]
    pub fn value(&self) -> &[u8] {
        &self.data[usize::from(self.key_len)..]
    }

    /// The value area, for filling in a detached (not yet inserted) entry.
    #[inline]
    pub fn value_mut(&mut self) -> &mut [u8] {
        let key_len = usize::from(self.key_len);
        &mut self.data[key_len..]
    }

    #[inline]
    pub fn value_len(&self) -> usize {
        self.data.len() - usize::from(self.key_len)
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    /// The CAS stamp assigned at creation; strictly increasing across the
    /// table's lifetime.
    #[inline]
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Bytes this entry accounts against the partition's volume.
    #[inline]
    pub fn volume(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for EntryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryData")
            .field("key", &String::from_utf8_lossy(self.key()))
            .field("value_len", &self.value_len())
            .field("flags", &self.flags)
            .field("stamp", &self.stamp)
            .finish()
    }
}

/// A counted reference to an entry held outside the partition table: a
/// command result, or a transmit splice.
///
/// Dropping the reference on a core other than the entry's home core defers
/// the unref to the home core through its chunk ring.
pub struct EntryRef {
    entry: Option<Arc<EntryData>>,
    home: Arc<CoreHandle>,
}

// === impl EntryRef ===

impl EntryRef {
    pub(crate) fn new(entry: Arc<EntryData>, home: Arc<CoreHandle>) -> Self {
        Self {
            entry: Some(entry),
            home,
        }
    }

    /// Releases the reference once a result no longer needs the entry.
    pub fn finish(self) {
        drop(self);
    }
}

impl Deref for EntryRef {
    type Target = EntryData;

    fn deref(&self) -> &EntryData {
        self.entry.as_ref().expect("EntryRef already finished")
    }
}

impl Clone for EntryRef {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            home: self.home.clone(),
        }
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };

        if mm_runtime::try_core_id() == Some(self.home.id()) {
            // Home core: unref (and possibly free) in place.
            drop(entry);
        } else {
            // Ship the unref home; the owning core drops it when it next
            // drains its chunk ring.
            self.home.free_remote(Box::new(entry));
        }
    }
}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry {
            Some(entry) => entry.fmt(f),
            None => f.pad("EntryRef(finished)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_splits_key_and_value() {
        let mut entry = EntryData::new(b"greeting", 5, 7, 0, 1).unwrap();
        entry.value_mut().copy_from_slice(b"hello");

        assert_eq!(entry.key(), b"greeting");
        assert_eq!(entry.value(), b"hello");
        assert_eq!(entry.value_len(), 5);
        assert_eq!(entry.flags(), 7);
        assert_eq!(entry.stamp(), 1);
        assert_eq!(entry.volume(), 13);
    }

    #[test]
    fn oversized_key_is_rejected() {
        let key = [b'k'; KEY_MAX + 1];
        assert!(matches!(
            EntryData::new(&key, 0, 0, 0, 1),
            Err(StoreError::KeyTooLong)
        ));
    }
}
