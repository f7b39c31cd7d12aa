//! Clock abstraction
//!
//! Throttling and fetch-gap checks read time through [`Clock`] so they can be
//! driven by a hand-advanced clock in tests. Timers themselves (batch window,
//! backoff, poll interval) go through `tokio::time`, which a paused test
//! runtime virtualises.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic instant used for interval arithmetic
    fn now(&self) -> Instant;

    /// Wall-clock time in milliseconds since the epoch
    fn timestamp_millis(&self) -> i64;
}

/// Clock backed by the tokio time driver and the system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn timestamp_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(Instant, i64)>,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            state: Mutex::new((Instant::now(), start_millis)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.0 += by;
        state.1 += by.as_millis() as i64;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.lock().0
    }

    fn timestamp_millis(&self) -> i64 {
        self.state.lock().1
    }
}
