//! Cooperative single-threaded event and rendezvous driver.
//!
//! `confluence` expresses asynchronous control flow through three pieces:
//!
//! - [`Event`](event::Event): a shared, single-shot notifier. Triggering an
//!   event delivers its identifier to the rendezvous it was created on and
//!   fires any chained notifiers. Dropping the last handle to an active
//!   event cancels it (and reports the leak).
//! - [`Rendezvous`](rendezvous::Rendezvous): a collection point where event
//!   completions queue up for a single waiter.
//! - [`Driver`](driver::Driver): the run loop. It pumps an ASAP FIFO, a
//!   timer heap, and I/O readiness into event triggers, and yields to
//!   closures whose rendezvous became ready.
//!
//! All state lives on one thread; the only blocking point is the I/O wait
//! inside a driver tick. Unix only.

pub mod clock;
pub mod driver;
pub mod event;
pub mod rendezvous;

pub mod prelude {
    pub use super::clock::{Clock, MonotonicClock, TestClock, TriggerTime};
    pub use super::driver::{Driver, DriverError, DriverState, Notifier, WakeHandle};
    pub use super::event::{Event, Slot};
    pub use super::rendezvous::Rendezvous;
}
