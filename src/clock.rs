use std::time::Instant;
use time::OffsetDateTime;

mod monotonic;
mod test_clock;

pub use monotonic::MonotonicClock;
pub use test_clock::TestClock;

/// Paired monotonic and wall-clock snapshot taken at a tick boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerTime {
    pub instant: Instant,
    pub system_time: OffsetDateTime,
}

pub trait Clock {
    fn trigger_time(&mut self) -> TriggerTime;
}
