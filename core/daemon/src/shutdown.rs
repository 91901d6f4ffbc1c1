//! Termination signals observed by the service loop.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tracing::warn;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

const HANDLED_SIGNALS: [libc::c_int; 3] = [libc::SIGTERM, libc::SIGINT, libc::SIGHUP];

extern "C" fn on_signal(signum: libc::c_int) {
    LAST_SIGNAL.store(signum, Ordering::SeqCst);
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Routes SIGTERM, SIGINT and SIGHUP to a flag the service loop polls.
pub fn install_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signum in HANDLED_SIGNALS {
        // SAFETY: the handler only stores to atomics, which is async-signal-safe.
        let previous = unsafe { libc::signal(signum, handler) };
        if previous == libc::SIG_ERR {
            warn!(signal = signum, "Failed to install signal handler");
        }
    }
}

/// The signal that asked us to stop, if any.
pub fn requested() -> Option<i32> {
    if STOP_REQUESTED.load(Ordering::SeqCst) {
        Some(LAST_SIGNAL.load(Ordering::SeqCst))
    } else {
        None
    }
}
