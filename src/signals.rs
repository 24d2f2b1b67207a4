//! SIGINT/SIGTERM turn into a flag the loops poll.

use std::sync::atomic::{ AtomicBool, Ordering };

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn install() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

/// The process-wide flag, for loops that take an `&AtomicBool`.
pub fn flag() -> &'static AtomicBool {
    &SHUTDOWN
}

pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
