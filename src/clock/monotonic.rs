use crate::clock::{Clock, TriggerTime};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Production clock backed by `Instant` arithmetic over a cached wall-time base.
///
/// Wall time is snapped once and advanced with monotonic elapsed time, with a
/// periodic resync to absorb clock adjustments and drift.
pub struct MonotonicClock {
    base_wall_time: OffsetDateTime,
    base_instant: Instant,
    last_resync: Instant,
    resync_interval: Duration,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            base_wall_time: OffsetDateTime::now_utc(),
            base_instant: now,
            last_resync: now,
            resync_interval: Duration::from_secs(1),
        }
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    fn resync(&mut self) {
        self.base_wall_time = OffsetDateTime::now_utc();
        self.base_instant = Instant::now();
        self.last_resync = self.base_instant;
    }
}

impl Clock for MonotonicClock {
    fn trigger_time(&mut self) -> TriggerTime {
        let mut now = Instant::now();
        if now.duration_since(self.last_resync) >= self.resync_interval {
            self.resync();
            now = self.base_instant;
        }
        TriggerTime {
            instant: now,
            system_time: self.base_wall_time + now.duration_since(self.base_instant),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
