//! Time source for the polling loops.

use std::time::Duration;

/// Sleeps between polls. Injected so tests can drive many ticks instantly.
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

/// Wall-clock [`Clock`] backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
