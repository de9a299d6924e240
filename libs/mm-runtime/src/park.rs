//! Thread parking for idle cores.
//!
//! The primary core never parks here: it sleeps inside its event backend's
//! `listen` call and is woken through the self-pipe. Secondary cores park on
//! a condvar with a timeout. Both expose the same [`Unpark`] surface so a
//! remote wake does not care which kind of core it is poking.

use core::time::Duration;
use std::sync::{Condvar, Mutex};

/// The wake half of a parking spot. Implementations must be idempotent: an
/// unpark of a core that is not parked must leave a token so the next park
/// returns immediately.
pub(crate) trait Unpark: Send + Sync {
    fn unpark(&self);
}

/// Mutex + condvar parking for secondary cores.
#[derive(Debug, Default)]
pub(crate) struct CondvarPark {
    /// The wake token: set by `unpark`, consumed by `park_timeout`.
    token: Mutex<bool>,
    cv: Condvar,
}

// === impl CondvarPark ===

impl CondvarPark {
    pub(crate) fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Parks the calling thread until unparked or until `timeout` passes.
    pub(crate) fn park_timeout(&self, timeout: Duration) {
        let mut token = match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if *token {
            *token = false;
            return;
        }

        let (mut token, _timed_out) = match self.cv.wait_timeout_while(token, timeout, |t| !*t) {
            Ok((guard, result)) => (guard, result.timed_out()),
            Err(poisoned) => {
                let (guard, result) = poisoned.into_inner();
                (guard, result.timed_out())
            }
        };
        *token = false;
    }
}

impl Unpark for CondvarPark {
    fn unpark(&self) {
        let mut token = match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *token = true;
        self.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn unpark_before_park_does_not_block() {
        let park = CondvarPark::new();
        park.unpark();

        let start = Instant::now();
        park.park_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn unpark_wakes_parked_thread() {
        let park = Arc::new(CondvarPark::new());

        let t = {
            let park = park.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                park.park_timeout(Duration::from_secs(10));
                start.elapsed()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        park.unpark();

        let waited = t.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn timeout_expires() {
        let park = CondvarPark::new();
        let start = Instant::now();
        park.park_timeout(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
