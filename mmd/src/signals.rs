//! SIGINT/SIGTERM handling: the handler only flips the process exit flag
//! (the one async-signal-safe thing we need); a watcher task on the primary
//! core notices and stops the cores.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// The process-wide exit flag.
static EXIT: AtomicBool = AtomicBool::new(false);

pub fn exit_requested() -> bool {
    EXIT.load(Ordering::Acquire)
}

extern "C" fn handle_signal(_signo: libc::c_int) {
    EXIT.store(true, Ordering::Release);
}

/// Installs the handlers.
///
/// # Errors
///
/// Fails if `sigaction` rejects the registration.
pub fn install() -> io::Result<()> {
    for signo in [libc::SIGINT, libc::SIGTERM] {
        // Safety: zeroed sigaction is a valid starting point; we fill in the
        // fields we use before handing it to the kernel.
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handle_signal as usize;
        // Safety: empty mask initialization.
        unsafe { libc::sigemptyset(&raw mut action.sa_mask) };
        action.sa_flags = libc::SA_RESTART;

        // Safety: `action` is fully initialized above.
        let rc = unsafe { libc::sigaction(signo, &raw const action, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
