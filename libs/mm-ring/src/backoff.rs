use core::hint;

/// An [exponential backoff] for spin loops.
///
/// This is a helper struct for spinning in a busy loop, with an exponentially
/// increasing number of spins up to a maximum value.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The default maximum exponent (2^8).
    pub const DEFAULT_MAX_EXPONENT: u8 = 8;

    /// Returns a new exponential backoff with the maximum exponent set to
    /// [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Backs off in a spin loop.
    ///
    /// Each time this function is called, it will issue `2^exp` [spin loop
    /// hints], where `exp` is the current exponent value (starting at 0). If
    /// `exp` is less than the configured maximum exponent, the exponent is
    /// incremented once the spin is complete.
    ///
    /// [spin loop hints]: hint::spin_loop
    #[inline(always)]
    pub fn spin(&mut self) {
        let spins = 1_u32 << self.exp;

        for _ in 0..spins {
            // In tests, especially in loom tests, we need to yield the thread back to the runtime
            // so it can make progress. See https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(loom)]
            mm_util::loom::thread::yield_now();
            #[cfg(all(test, not(loom)))]
            std::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1;
        }
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.exp = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
