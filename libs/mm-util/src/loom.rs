//! Shims that switch between `core`/`std` synchronization types and their
//! [`loom`](https://docs.rs/loom) mocks when compiled with `--cfg loom`.
//!
//! Code that wants to be exercised under loom's model checker imports its
//! atomics and `UnsafeCell` from here instead of `core`.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub use loom::sync;
        pub use loom::cell;
        pub use loom::model;
        pub use loom::thread;
    } else {
        /// Runs `f` directly; under loom this would instead explore all
        /// interleavings of the closure body.
        #[inline(always)]
        pub fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }

        pub mod sync {
            pub use core::sync::*;
        }

        pub mod cell {
            /// An [`UnsafeCell`](core::cell::UnsafeCell) with loom's
            /// closure-based access API, so call sites compile unchanged with
            /// and without `--cfg loom`.
            #[derive(Debug)]
            pub struct UnsafeCell<T: ?Sized>(core::cell::UnsafeCell<T>);

            impl<T: ?Sized> UnsafeCell<T> {
                #[inline(always)]
                pub fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
                    f(self.0.get())
                }

                #[inline(always)]
                pub fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
                    f(self.0.get())
                }

                #[inline(always)]
                pub fn get_mut(&mut self) -> &mut T {
                    self.0.get_mut()
                }
            }

            impl<T> UnsafeCell<T> {
                pub const fn new(data: T) -> UnsafeCell<T> {
                    UnsafeCell(core::cell::UnsafeCell::new(data))
                }

                #[inline(always)]
                pub fn into_inner(self) -> T {
                    self.0.into_inner()
                }
            }
        }
    }
}
