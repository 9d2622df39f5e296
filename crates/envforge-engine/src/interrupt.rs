use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Cancellation flag checked between modules and while a command runs.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    local: Arc<AtomicBool>,
    watch_signals: bool,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes SIGINT and SIGTERM into the returned flag.
    pub fn with_signal_handlers() -> Self {
        install_signal_handlers();
        Self {
            local: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        }
    }

    pub fn trigger(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.local.load(Ordering::SeqCst) || (self.watch_signals && SIGNALLED.load(Ordering::SeqCst))
    }
}

#[cfg(unix)]
extern "C" fn handle_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only touches an atomic, which is async-signal-safe.
        unsafe {
            libc::signal(signal, handler);
        }
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}
