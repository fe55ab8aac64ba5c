//! Shutdown barrier for the delivery callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Lets teardown wait for an in-flight delivery before the sink goes away.
#[derive(Debug, Default)]
pub struct CallbackGate {
    running: AtomicBool,
    shutdown: AtomicBool,
}

/// Marks a delivery as in flight until dropped.
#[must_use]
pub struct CallbackGuard<'a> {
    gate: &'a CallbackGate,
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::Release);
    }
}

impl CallbackGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the callback, or `None` while a shutdown is pending.
    ///
    /// `running` is raised before `shutdown` is read; with the reverse order
    /// in [`CallbackGate::wait_for_idle`] one side always sees the other.
    pub fn enter(&self) -> Option<CallbackGuard<'_>> {
        self.running.store(true, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::Release);
            return None;
        }
        Some(CallbackGuard { gate: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Refuse new entries and yield until the in-flight callback finishes,
    /// at most `timeout`. Returns `false` if it had to be force-cleared.
    /// The gate accepts entries again afterwards.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.shutdown.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let mut idle = true;
        while self.running.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                tracing::error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "delivery callback still running; forcing release"
                );
                self.running.store(false, Ordering::Release);
                idle = false;
                break;
            }
            std::thread::yield_now();
        }
        self.shutdown.store(false, Ordering::SeqCst);
        idle
    }
}
