//! A small spinlock used for short critical sections: wait-queue internals
//! and the storage partitions' task lock.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use mm_ring::Backoff;
use mm_util::loom::cell::UnsafeCell;
use mm_util::loom::sync::atomic::{AtomicBool, Ordering};
use mm_util::loom_const_fn;

/// A mutual exclusion primitive that spins (with exponential backoff) while
/// contended.
///
/// Critical sections guarded by this lock must be short and must never
/// suspend: a task holding it across an `.await` would spin out every other
/// contender on the lock, possibly on their own cores.
pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

/// An RAII guard; the lock is released when this is dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: the lock protocol hands out exclusive access to `data`, so sharing
// the mutex across threads is safe whenever moving the data would be.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// Safety: see above.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

// === impl Mutex ===

impl<T> Mutex<T> {
    loom_const_fn! {
        pub const fn new(data: T) -> Self {
            Self {
                locked: AtomicBool::new(false),
                data: UnsafeCell::new(data),
            }
        }
    }

}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut boff = Backoff::new();
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.spin();
            }
        }

        MutexGuard {
            mutex: self,
            marker: PhantomData,
        }
    }

    /// Attempts to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard {
                mutex: self,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Returns a mutable reference to the underlying data without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // Safety: `&mut self` guarantees no guard exists.
        self.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + core::fmt::Debug> core::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

// === impl MutexGuard ===

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard owns the lock.
        self.mutex.data.with(|data| unsafe { &*data })
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard owns the lock.
        self.mutex.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter() {
        let mutex = Arc::new(Mutex::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let mutex = mutex.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *mutex.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*mutex.lock(), 40_000);
    }

    #[test]
    fn try_lock_contended() {
        let mutex = Mutex::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use mm_util::loom;
    use std::sync::Arc;

    #[test]
    fn mutual_exclusion() {
        loom::model(|| {
            let mutex = Arc::new(Mutex::new(0u32));

            let a = {
                let mutex = mutex.clone();
                loom::thread::spawn(move || *mutex.lock() += 1)
            };
            let b = {
                let mutex = mutex.clone();
                loom::thread::spawn(move || *mutex.lock() += 1)
            };

            a.join().unwrap();
            b.join().unwrap();
            assert_eq!(*mutex.lock(), 2);
        });
    }
}
