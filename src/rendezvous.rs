//! Collection points for event completions.
//!
//! A [`Rendezvous`] tracks the events created on it while they are active,
//! queues the identifier pairs of the ones that have fired, and holds at
//! most one blocked closure to wake when a completion arrives. Destroying a
//! rendezvous disowns its remaining active events: they become empty and can
//! no longer deliver, but they stay safe to trigger for as long as handles
//! to them exist.

use crate::event::{Annotation, Event, Rid, SimpleEvent, Slot};
use slab::Slab;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::Location;
use std::rc::{Rc, Weak};

pub(crate) type BlockedWaker = Box<dyn FnOnce()>;

pub(crate) struct RendezvousCore {
    /// Active events keyed by the slot each event remembers, so trigger can
    /// unlink in O(1). Entries are non-owning.
    active: Slab<Weak<SimpleEvent>>,
    fired: VecDeque<Rid>,
    waker: Option<BlockedWaker>,
    pub(crate) volatile: bool,
}

impl RendezvousCore {
    fn new(volatile: bool) -> Self {
        Self {
            active: Slab::new(),
            fired: VecDeque::new(),
            waker: None,
            volatile,
        }
    }

    pub(crate) fn add(&mut self, event: &Rc<SimpleEvent>) -> usize {
        self.active.insert(Rc::downgrade(event))
    }

    pub(crate) fn remove(&mut self, key: usize) {
        let _ = self.active.try_remove(key);
    }

    /// Record a completion and release the blocked waker, if any. The caller
    /// invokes the returned waker once its own borrows are gone.
    pub(crate) fn complete(&mut self, rid: Rid) -> Option<BlockedWaker> {
        self.fired.push_back(rid);
        self.waker.take()
    }
}

impl Drop for RendezvousCore {
    fn drop(&mut self) {
        for (_, event) in self.active.iter() {
            if let Some(event) = event.upgrade() {
                event.disown();
            }
        }
    }
}

/// A queue of completions with per-event identifiers and a single waiter.
pub struct Rendezvous {
    core: Rc<RefCell<RendezvousCore>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            core: Rc::new(RefCell::new(RendezvousCore::new(false))),
        }
    }

    /// A rendezvous that suppresses leak diagnostics for its events.
    pub fn new_volatile() -> Self {
        Self {
            core: Rc::new(RefCell::new(RendezvousCore::new(true))),
        }
    }

    #[track_caller]
    fn make_simple(&self, rid: Rid) -> Rc<SimpleEvent> {
        let caller = Location::caller();
        let event = Rc::new(SimpleEvent::new_inactive(Some(Annotation {
            file: caller.file(),
            line: caller.line(),
        })));
        let key = self.core.borrow_mut().add(&event);
        event.bind(Rc::downgrade(&self.core), key, rid);
        event
    }

    #[track_caller]
    pub fn make_event(&self) -> Event {
        Event::from_parts(self.make_simple((0, 0)), None)
    }

    #[track_caller]
    pub fn make_event_id(&self, rid0: u32) -> Event {
        Event::from_parts(self.make_simple((rid0, 0)), None)
    }

    #[track_caller]
    pub fn make_event_ids(&self, rid0: u32, rid1: u32) -> Event {
        Event::from_parts(self.make_simple((rid0, rid1)), None)
    }

    #[track_caller]
    pub fn make_slot_event<T>(&self, slot: &Slot<T>) -> Event<T> {
        Event::from_parts(self.make_simple((0, 0)), Some(slot.clone()))
    }

    #[track_caller]
    pub fn make_slot_event_id<T>(&self, rid0: u32, slot: &Slot<T>) -> Event<T> {
        Event::from_parts(self.make_simple((rid0, 0)), Some(slot.clone()))
    }

    /// True when at least one completion is waiting to be joined.
    pub fn has_ready(&self) -> bool {
        !self.core.borrow().fired.is_empty()
    }

    /// Pop the oldest completion's identifier pair.
    pub fn join(&self) -> Option<Rid> {
        self.core.borrow_mut().fired.pop_front()
    }

    /// Pop the oldest completion, keeping only its first identifier.
    pub fn join_id(&self) -> Option<u32> {
        self.join().map(|(rid0, _)| rid0)
    }

    /// Number of events created on this rendezvous that have not fired yet.
    pub fn active_count(&self) -> usize {
        self.core.borrow().active.len()
    }

    /// Park `waker` until the next completion. At most one closure may be
    /// blocked at a time; a second `block` is a programming error and
    /// panics. If a completion is already queued the waker runs right away.
    pub fn block(&self, waker: impl FnOnce() + 'static) {
        let mut core = self.core.borrow_mut();
        assert!(
            core.waker.is_none(),
            "rendezvous already has a blocked closure"
        );
        if core.fired.is_empty() {
            core.waker = Some(Box::new(waker));
        } else {
            drop(core);
            waker();
        }
    }

    /// Discard the blocked closure, if any.
    pub fn unblock(&self) {
        self.core.borrow_mut().waker = None;
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_join_is_fifo() {
        let r = Rendezvous::new();
        let e1 = r.make_event_id(1);
        let e2 = r.make_event_id(2);
        let e3 = r.make_event_ids(3, 30);
        e2.trigger(());
        e1.trigger(());
        e3.trigger(());
        assert_eq!(r.join(), Some((2, 0)));
        assert_eq!(r.join_id(), Some(1));
        assert_eq!(r.join(), Some((3, 30)));
        assert_eq!(r.join(), None);
    }

    #[test]
    fn test_has_ready() {
        let r = Rendezvous::new();
        let e = r.make_event();
        assert!(!r.has_ready());
        e.trigger(());
        assert!(r.has_ready());
        r.join();
        assert!(!r.has_ready());
    }

    #[test]
    fn test_active_count_tracks_lifecycle() {
        let r = Rendezvous::new();
        let e1 = r.make_event();
        let e2 = r.make_event();
        assert_eq!(r.active_count(), 2);
        e1.trigger(());
        assert_eq!(r.active_count(), 1);
        drop(e2);
        assert_eq!(r.active_count(), 0);
    }

    #[test]
    fn test_blocked_waker_runs_once_per_completion() {
        let r = Rendezvous::new();
        let e1 = r.make_event();
        let e2 = r.make_event();
        let wakes = Rc::new(Cell::new(0u32));
        let counter = wakes.clone();
        r.block(move || counter.set(counter.get() + 1));
        e1.trigger(());
        assert_eq!(wakes.get(), 1);
        // The waker was consumed; a second completion does not rerun it.
        e2.trigger(());
        assert_eq!(wakes.get(), 1);
        assert_eq!(r.join(), Some((0, 0)));
        assert_eq!(r.join(), Some((0, 0)));
    }

    #[test]
    fn test_waker_observes_queued_completion() {
        let r = Rc::new(Rendezvous::new());
        let e = r.make_event_id(4);
        let seen = Rc::new(Cell::new(None));
        let inner_r = r.clone();
        let inner_seen = seen.clone();
        r.block(move || inner_seen.set(inner_r.join()));
        e.trigger(());
        assert_eq!(seen.get(), Some((4, 0)));
    }

    #[test]
    fn test_block_with_pending_completion_wakes_immediately() {
        let r = Rendezvous::new();
        let e = r.make_event();
        e.trigger(());
        let woke = Rc::new(Cell::new(false));
        let flag = woke.clone();
        r.block(move || flag.set(true));
        assert!(woke.get());
    }

    #[test]
    #[should_panic(expected = "already has a blocked closure")]
    fn test_double_block_panics() {
        let r = Rendezvous::new();
        let _e = r.make_event();
        r.block(|| {});
        r.block(|| {});
    }

    #[test]
    fn test_unblock_discards_waiter() {
        let r = Rendezvous::new();
        let e = r.make_event();
        let woke = Rc::new(Cell::new(false));
        let flag = woke.clone();
        r.block(move || flag.set(true));
        r.unblock();
        e.trigger(());
        assert!(!woke.get());
        assert!(r.has_ready());
    }

    #[test]
    fn test_drop_disowns_active_events() {
        let r = Rendezvous::new();
        let e = r.make_event();
        drop(r);
        assert!(e.empty());
        // Triggering a disowned event stays a safe no-op.
        e.trigger(());
        e.unblock();
    }

    #[test]
    fn test_drop_discards_unjoined_completions() {
        let r = Rendezvous::new();
        let e = r.make_event();
        e.trigger(());
        drop(r);
        assert!(e.empty());
    }

    #[test]
    fn test_drop_fires_chains_of_disowned_events() {
        let r = Rendezvous::new();
        let rn = Rendezvous::new();
        let e = r.make_event();
        let n = rn.make_event();
        e.at_trigger(n.clone());
        drop(r);
        assert!(n.empty());
        assert_eq!(rn.join(), Some((0, 0)));
    }
}
