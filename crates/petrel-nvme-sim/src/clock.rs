//! Virtual time.

use std::sync::atomic::{AtomicU64, Ordering};

use petrel_platform::Clock;

/// A monotonic virtual clock. `sleep_ms` advances time by the requested
/// amount; `now_ms` additionally ticks forward by `step_ms` per call, so
/// busy-wait loops make progress toward their deadlines instead of spinning
/// forever when a completion never arrives.
pub struct VirtualClock {
    now: AtomicU64,
    step_ms: u64,
}

impl VirtualClock {
    pub fn new(step_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step_ms,
        }
    }

    /// Current virtual time without advancing it (for observers such as the
    /// simulated controller).
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.now.fetch_add(self.step_ms, Ordering::SeqCst) + self.step_ms
    }

    fn sleep_ms(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}
