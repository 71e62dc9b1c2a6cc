use crate::clock::{Clock, TriggerTime};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Synthetic clock for tests: starts at Unix epoch and only moves when told to.
///
/// Clones share the same state, so a test can hand one handle to the driver
/// and keep another to advance time between ticks.
pub struct TestClock {
    inner: Rc<RefCell<TestClockInner>>,
}

struct TestClockInner {
    baseline_wall_time: OffsetDateTime,
    baseline_instant: Instant,
    elapsed: Duration,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(TestClockInner {
                baseline_wall_time: OffsetDateTime::UNIX_EPOCH,
                baseline_instant: Instant::now(),
                elapsed: Duration::ZERO,
            })),
        }
    }

    /// Advance both monotonic and wall time.
    pub fn advance(&self, duration: Duration) {
        self.inner.borrow_mut().elapsed += duration;
    }

    pub fn set_elapsed(&self, elapsed: Duration) {
        self.inner.borrow_mut().elapsed = elapsed;
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.borrow().elapsed
    }
}

impl Clock for TestClock {
    fn trigger_time(&mut self) -> TriggerTime {
        let inner = self.inner.borrow();
        TriggerTime {
            instant: inner.baseline_instant + inner.elapsed,
            system_time: inner.baseline_wall_time + inner.elapsed,
        }
    }
}

impl Clone for TestClock {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}
