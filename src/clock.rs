//! Wall-clock abstraction
//!
//! Entries persist across restarts (disk, Redis), so their timestamps are
//! wall-clock `SystemTime`s rather than `Instant`s. Tiers read the time through
//! [`Clock`] so expiry can be driven deterministically.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

/// Source of the current wall-clock time
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;
}

/// Real system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock
///
/// Starts at the system time of construction and only moves when
/// [`advance`](ManualClock::advance) is called.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(SystemTime::now()),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
