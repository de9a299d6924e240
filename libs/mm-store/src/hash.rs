//! Key hashing and routing.
//!
//! Keys are hashed once with 32-bit FNV-1a. The low bits select the
//! partition; the remaining high bits place the entry inside the partition's
//! bucket array. The two bit ranges are disjoint, so expanding a partition
//! can never move an entry to a different partition.

/// 32-bit FNV-1a.
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A key's routing decision: which partition, and which hash bits to use for
/// bucket placement there.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Route {
    /// Partition index: `hash & part_mask`.
    pub part: usize,
    /// Bucket-placement bits: `hash >> part_bits`.
    pub hash: u32,
}

impl Route {
    pub fn new(key: &[u8], part_bits: u32) -> Self {
        let hash = fnv1a(key);
        let part_mask = (1u32 << part_bits) - 1;
        Self {
            part: (hash & part_mask) as usize,
            hash: hash >> part_bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_vectors() {
        // from the FNV reference implementation
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn partition_bits_are_disjoint_from_bucket_bits() {
        let key = b"some-key";
        let part_bits = 3;
        let route = Route::new(key, part_bits);

        let hash = fnv1a(key);
        assert_eq!(route.part, (hash & 0b111) as usize);
        assert_eq!(route.hash, hash >> 3);
    }

    #[test]
    fn zero_partition_bits_use_the_whole_hash_for_buckets() {
        let route = Route::new(b"k", 0);
        assert_eq!(route.part, 0);
        assert_eq!(route.hash, fnv1a(b"k"));
    }
}
