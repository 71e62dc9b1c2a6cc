//! The run loop.
//!
//! A [`Driver`] pumps three trigger sources (the ASAP FIFO, the timer
//! heap, and I/O readiness) and yields to closures whose rendezvous became
//! ready. One [`cycle`](Driver::cycle) performs, in order:
//!
//! 1. refresh the time snapshot;
//! 2. fire every timer whose deadline has passed, in `(deadline,
//!    insertion)` order;
//! 3. drain the ASAP set in insertion order;
//! 4. run closures made runnable so far;
//! 5. block in the I/O backend (not at all if more work is already queued,
//!    else until the next timer deadline) and fire ready registrations;
//! 6. run closures made runnable by I/O.
//!
//! [`run`](Driver::run) repeats cycles until [`stop`](Driver::stop) is
//! called or nothing can ever fire again: no timers survive the cull, the
//! ASAP set and closure queue are empty, and no fd, waker, or signal
//! registration is live.

mod asap;
mod fired;
mod io;
mod timer;

pub use self::io::Notifier;

use self::asap::AsapSet;
use self::fired::FiredList;
use self::io::IoBackend;
use self::timer::TimerSet;
use crate::clock::{Clock, MonotonicClock, TriggerTime};
use crate::event::Event;
use enum_as_inner::EnumAsInner;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io as stdio;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum DriverState {
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("a driver is already installed on this thread")]
    AlreadyInstalled,
    #[error("no driver is installed on this thread")]
    NotInstalled,
    #[error(transparent)]
    Io(#[from] stdio::Error),
}

type Thunk = Box<dyn FnOnce(&mut Driver)>;

/// Shared handle onto the driver's runnable-closure queue.
///
/// A rendezvous waker calls [`defer`](WakeHandle::defer) to mark its
/// continuation runnable; the driver invokes queued thunks with `&mut
/// Driver` at the closure-run points of the tick.
#[derive(Clone)]
pub struct WakeHandle {
    queue: Rc<RefCell<VecDeque<Thunk>>>,
}

impl WakeHandle {
    fn new() -> Self {
        Self {
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn defer(&self, thunk: impl FnOnce(&mut Driver) + 'static) {
        self.queue.borrow_mut().push_back(Box::new(thunk));
    }

    fn pop(&self) -> Option<Thunk> {
        self.queue.borrow_mut().pop_front()
    }

    fn has_work(&self) -> bool {
        !self.queue.borrow().is_empty()
    }
}

pub struct Driver {
    clock: Box<dyn Clock>,
    snapshot: TriggerTime,
    asap: AsapSet,
    timers: TimerSet,
    fired: FiredList,
    io: IoBackend,
    unblocked: WakeHandle,
    state: DriverState,
}

impl Driver {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        let mut clock = Box::new(clock);
        let snapshot = clock.trigger_time();
        Self {
            clock,
            snapshot,
            asap: AsapSet::new(),
            timers: TimerSet::new(),
            fired: FiredList::new(),
            io: IoBackend::new(),
            unblocked: WakeHandle::new(),
            state: DriverState::Running,
        }
    }

    /// Monotonic time as of the current tick boundary.
    pub fn now(&self) -> Instant {
        self.snapshot.instant
    }

    /// Wall-clock time as of the current tick boundary.
    pub fn wall_now(&self) -> OffsetDateTime {
        self.snapshot.system_time
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Request that the run loop exit after the current step.
    pub fn stop(&mut self) {
        self.state = DriverState::Stopped;
    }

    pub fn wake_handle(&self) -> WakeHandle {
        self.unblocked.clone()
    }

    /// Fire `event` before the next I/O wait. Empty events are ignored.
    pub fn at_asap(&mut self, event: Event) {
        if !event.empty() {
            self.asap.push(event.into_simple());
        }
    }

    /// Fire `event` once `when` has passed. Empty events are ignored.
    pub fn at_time(&mut self, when: Instant, event: Event) {
        if !event.empty() {
            self.timers.push(when, event.into_simple());
        }
    }

    /// Fire `event` after `delay`, measured from the current tick's snapshot.
    pub fn at_delay(&mut self, delay: Duration, event: Event) {
        self.at_time(self.snapshot.instant + delay, event);
    }

    /// Fire `event` when `fd` becomes readable.
    pub fn fd_readable(&mut self, fd: RawFd, event: Event) {
        if !event.empty() {
            self.io.fd_readable(fd, event.into_simple());
        }
    }

    /// Fire `event` when `fd` becomes writable.
    pub fn fd_writable(&mut self, fd: RawFd, event: Event) {
        if !event.empty() {
            self.io.fd_writable(fd, event.into_simple());
        }
    }

    /// Fire every registration for `fd` now and drop interest in it.
    pub fn kill_fd(&mut self, fd: RawFd) {
        self.io.kill_fd(fd, &mut self.fired);
        self.drain_fired();
    }

    /// Fire `event` when signal `signum` is delivered.
    pub fn signal(&mut self, signum: i32, event: Event) -> Result<(), DriverError> {
        if !event.empty() {
            self.io.signal(signum, event.into_simple())?;
        }
        Ok(())
    }

    /// A thread-safe notifier that fires `event` through the poll loop.
    pub fn notifier(&mut self, event: Event) -> stdio::Result<Notifier> {
        self.io.notifier(event.into_simple())
    }

    /// One tick. `timeout` caps the I/O wait; tests drive synthetic clocks
    /// with `Some(Duration::ZERO)`.
    pub fn cycle(&mut self, timeout: Option<Duration>) -> stdio::Result<DriverState> {
        self.snapshot = self.clock.trigger_time();
        let now = self.snapshot.instant;

        self.timers.cull();
        while self.timers.expiry().is_some_and(|when| when <= now) {
            self.timers.pop_trigger();
        }
        while let Some(event) = self.asap.pop() {
            event.trigger();
        }
        self.run_unblocked();
        if self.state.is_stopped() {
            return Ok(self.state);
        }

        let wait = self.wait_timeout(timeout);
        self.io.poll(wait, &mut self.fired)?;
        self.drain_fired();
        self.run_unblocked();
        Ok(self.state)
    }

    /// One tick with the wait computed from queued work alone.
    pub fn run_once(&mut self) -> stdio::Result<DriverState> {
        self.cycle(None)
    }

    /// Cycle until stopped or no outstanding work remains.
    pub fn run(&mut self) -> stdio::Result<()> {
        self.state = DriverState::Running;
        while self.state.is_running() && self.has_work() {
            self.run_once()?;
        }
        Ok(())
    }

    /// True while something could still fire: a live timer, queued ASAP
    /// work, a runnable closure, or backend interest.
    pub fn has_work(&mut self) -> bool {
        self.timers.cull();
        !self.asap.is_empty()
            || !self.timers.is_empty()
            || !self.fired.is_empty()
            || self.unblocked.has_work()
            || self.io.has_interest()
    }

    fn wait_timeout(&self, cap: Option<Duration>) -> Option<Duration> {
        let computed = if !self.asap.is_empty() || self.unblocked.has_work() {
            Some(Duration::ZERO)
        } else {
            self.timers
                .expiry()
                .map(|when| when.saturating_duration_since(self.snapshot.instant))
        };
        match (computed, cap) {
            (Some(computed), Some(cap)) => Some(computed.min(cap)),
            (Some(computed), None) => Some(computed),
            (None, cap) => cap,
        }
    }

    fn drain_fired(&mut self) {
        while let Some(event) = self.fired.pop() {
            event.trigger();
        }
    }

    fn run_unblocked(&mut self) {
        while self.state.is_running() {
            match self.unblocked.pop() {
                Some(thunk) => thunk(self),
                None => break,
            }
        }
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Driver>> = const { RefCell::new(None) };
}

/// Install `driver` as this thread's process-wide instance.
pub fn initialize(driver: Driver) -> Result<(), DriverError> {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.is_some() {
            return Err(DriverError::AlreadyInstalled);
        }
        *current = Some(driver);
        Ok(())
    })
}

/// Borrow the installed driver. Panics when none is installed; inside a
/// running loop, closures should use the `&mut Driver` they are handed
/// instead.
pub fn with<R>(f: impl FnOnce(&mut Driver) -> R) -> R {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let driver = current
            .as_mut()
            .expect("no driver installed on this thread");
        f(driver)
    })
}

/// Run the installed driver to completion. The driver leaves the
/// thread-local slot for the duration of the loop.
pub fn run() -> stdio::Result<()> {
    let mut driver = CURRENT
        .with(|current| current.borrow_mut().take())
        .ok_or_else(|| stdio::Error::other(DriverError::NotInstalled))?;
    let result = driver.run();
    CURRENT.with(|current| *current.borrow_mut() = Some(driver));
    result
}

/// Tear down the installed driver, releasing every residual reference.
pub fn cleanup() {
    CURRENT.with(|current| current.borrow_mut().take());
}

pub fn at_asap(event: Event) {
    with(|driver| driver.at_asap(event));
}

pub fn at_time(when: Instant, event: Event) {
    with(|driver| driver.at_time(when, event));
}

pub fn at_delay(delay: Duration, event: Event) {
    with(|driver| driver.at_delay(delay, event));
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::rendezvous::Rendezvous;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::thread;

    #[test]
    fn test_fd_readiness_triggers_event() {
        let mut driver = Driver::new();
        let r = Rendezvous::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        driver.fd_readable(listener.as_raw_fd(), r.make_event());

        let client = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut stream = TcpStream::connect(addr).unwrap();
            let _ = stream.write_all(b"ping");
        });

        driver.run().unwrap();
        assert_eq!(r.join(), Some((0, 0)));
        client.join().unwrap();
    }

    #[test]
    fn test_notifier_wakes_poll_from_another_thread() {
        let mut driver = Driver::new();
        let r = Rendezvous::new();
        let notifier = driver.notifier(r.make_event()).unwrap();

        let waker_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.notify().unwrap();
        });

        driver.run().unwrap();
        assert_eq!(r.join(), Some((0, 0)));
        waker_thread.join().unwrap();
    }

    #[test]
    fn test_timer_fires_in_real_time() {
        let started = Instant::now();
        let mut driver = Driver::new();
        let r = Rendezvous::new();
        driver.at_delay(Duration::from_millis(20), r.make_event());
        driver.run().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(r.join(), Some((0, 0)));
    }

    #[test]
    fn test_kill_fd_fires_pending_registrations() {
        let mut driver = Driver::new();
        let r = Rendezvous::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        driver.fd_readable(listener.as_raw_fd(), r.make_event_id(1));
        driver.fd_writable(listener.as_raw_fd(), r.make_event_id(2));
        driver.kill_fd(listener.as_raw_fd());
        assert_eq!(r.join_id(), Some(1));
        assert_eq!(r.join_id(), Some(2));
        assert!(!driver.has_work());
    }

    #[test]
    fn test_signal_delivery_triggers_event() {
        let mut driver = Driver::new();
        let r = Rendezvous::new();
        driver.signal(libc::SIGUSR1, r.make_event()).unwrap();

        let raiser = thread::spawn(|| {
            thread::sleep(Duration::from_millis(20));
            unsafe {
                libc::raise(libc::SIGUSR1);
            }
        });

        driver.run().unwrap();
        assert_eq!(r.join(), Some((0, 0)));
        raiser.join().unwrap();
    }

    #[test]
    fn test_readiness_for_cancelled_registration_is_noop() {
        let mut driver = Driver::new();
        let r = Rendezvous::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let e = r.make_event();
        driver.fd_readable(listener.as_raw_fd(), e.clone());
        // Cancel through another path before readiness arrives.
        e.bind_all().trigger(());
        r.join();
        let _stream = TcpStream::connect(addr).unwrap();
        // The pruned registration leaves nothing to wait on.
        driver.run().unwrap();
        assert_eq!(r.join(), None);
    }
}
