//! SIGINT/SIGTERM handling
//!
//! The handler only raises a flag; the runner checks it between steps.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install handlers for SIGINT and SIGTERM.
#[cfg(unix)]
pub fn install() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only performs an atomic store, which is async-signal-safe
        let previous = unsafe { libc::signal(signum, handler) };
        if previous == libc::SIG_ERR {
            log::warn!("Could not install handler for signal {signum}");
        }
    }
}

#[cfg(not(unix))]
pub fn install() {}

/// Flag raised by the handlers.
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}
