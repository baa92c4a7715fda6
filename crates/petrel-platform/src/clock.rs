//! Time source.

/// Monotonic milliseconds plus a blocking sleep.
///
/// Drivers take a `Clock` handle instead of calling the kernel timer
/// directly; the simulated implementation advances virtual time so timeout
/// paths run instantly in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}
