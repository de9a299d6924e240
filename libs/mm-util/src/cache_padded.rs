use core::ops::{Deref, DerefMut};

/// `CachePadded` wraps an inner type `T` applying architecture-specific padding to ensure the type
/// takes up exactly one cache line on the target architecture. This avoids [false sharing] between
/// a ring's producer and consumer indices, or between a lock word and unrelated hot data.
///
/// The alignment rules follow crossbeam-utils: starting from Intel's Sandy Bridge the spatial
/// prefetcher pulls pairs of 64-byte cache lines at a time, so x86_64 aligns to 128 bytes rather
/// than 64; ARM big.LITTLE "big" cores and powerpc64 also use 128-byte lines. Everything else this
/// project targets has 64-byte lines.
///
/// [false sharing]: <https://en.wikipedia.org/wiki/False_sharing>
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> From<T> for CachePadded<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}
