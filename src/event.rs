//! Single-shot events.
//!
//! An [`Event`] is a handle onto a shared occurrence. The occurrence is
//! either *active* (bound to a rendezvous, waiting to happen) or *empty*
//! (already triggered or cancelled). Triggering delivers the event's
//! identifier pair to its rendezvous, wakes the rendezvous's blocked
//! closure, and fires any chained notifiers. This happens exactly once, no
//! matter how many handles share the occurrence or how often `trigger` is
//! called.
//!
//! Handles are cheap to clone; the occurrence lives as long as any handle,
//! scheduling container, or notifier chain references it. When the last
//! reference to a still-active occurrence goes away, the occurrence is
//! unblocked (triggered without writing its slot) and, unless its
//! rendezvous is volatile, a leak diagnostic is reported with the event's
//! creation site.

use crate::rendezvous::RendezvousCore;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

pub(crate) type Rid = (u32, u32);

/// Source position attached to an event for leak diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Annotation {
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

thread_local! {
    static LEAK_HANDLER: RefCell<Option<Box<dyn FnMut(&str)>>> = const { RefCell::new(None) };
    static DEAD: Rc<SimpleEvent> = Rc::new(SimpleEvent::new_inactive(None));
}

/// Install a handler for "active event leaked" reports on this thread.
///
/// Without a handler, reports go to `tracing::warn!`.
pub fn set_leak_handler(handler: impl FnMut(&str) + 'static) {
    LEAK_HANDLER.with(|slot| *slot.borrow_mut() = Some(Box::new(handler)));
}

pub fn clear_leak_handler() {
    LEAK_HANDLER.with(|slot| *slot.borrow_mut() = None);
}

fn report_leak(annotation: Option<Annotation>) {
    let line = match annotation {
        Some(annotation) => format!("{annotation}: active event leaked"),
        None => "active event leaked".to_string(),
    };
    // The handler runs outside the thread-local borrow so it may itself
    // create or drop events.
    let handler = LEAK_HANDLER.with(|slot| slot.borrow_mut().take());
    match handler {
        Some(mut handler) => {
            handler(&line);
            LEAK_HANDLER.with(|slot| {
                let mut slot = slot.borrow_mut();
                if slot.is_none() {
                    *slot = Some(handler);
                }
            });
        }
        None => tracing::warn!("{line}"),
    }
}

/// The back-reference an active occurrence keeps to its rendezvous: the
/// rendezvous does not own the event and the event does not own the
/// rendezvous.
struct Binding {
    rendezvous: Weak<RefCell<RendezvousCore>>,
    key: usize,
    rid: Rid,
}

/// The shared core of an occurrence. Handles, scheduling containers, and
/// notifier chains all hold `Rc<SimpleEvent>`; the strong count is the
/// occurrence's reference count.
pub(crate) struct SimpleEvent {
    inner: RefCell<EventInner>,
}

struct EventInner {
    /// `Some` while active; taken exactly once, by whichever of trigger,
    /// disown, or last-drop happens first.
    binding: Option<Binding>,
    /// Notifiers to fire after this occurrence, in registration order.
    chain: VecDeque<Rc<SimpleEvent>>,
    /// True while `chain` is being drained, so notifiers registered
    /// reentrantly are appended and picked up by the ongoing drain.
    propagating: bool,
    annotation: Option<Annotation>,
}

impl SimpleEvent {
    pub(crate) fn new_inactive(annotation: Option<Annotation>) -> Self {
        Self {
            inner: RefCell::new(EventInner {
                binding: None,
                chain: VecDeque::new(),
                propagating: false,
                annotation,
            }),
        }
    }

    /// The process-wide immortal empty occurrence backing default handles.
    pub(crate) fn make_dead() -> Rc<SimpleEvent> {
        DEAD.with(Rc::clone)
    }

    pub(crate) fn bind(&self, rendezvous: Weak<RefCell<RendezvousCore>>, key: usize, rid: Rid) {
        self.inner.borrow_mut().binding = Some(Binding {
            rendezvous,
            key,
            rid,
        });
    }

    #[inline(always)]
    pub(crate) fn empty(&self) -> bool {
        self.inner.borrow().binding.is_none()
    }

    /// Fire the occurrence. Returns true if it was active; a second call is
    /// a no-op.
    pub(crate) fn trigger(&self) -> bool {
        let binding = match self.inner.borrow_mut().binding.take() {
            Some(binding) => binding,
            None => return false,
        };
        Self::deliver(binding);
        self.propagate_chain();
        true
    }

    /// Sever the rendezvous back-reference without delivering a completion.
    /// Called for each active event when its rendezvous is torn down; must
    /// not touch the rendezvous, which is mid-destruction.
    pub(crate) fn disown(&self) {
        if self.inner.borrow_mut().binding.take().is_some() {
            self.propagate_chain();
        }
    }

    pub(crate) fn at_trigger(&self, notifier: Rc<SimpleEvent>) {
        let mut inner = self.inner.borrow_mut();
        if inner.binding.is_some() || inner.propagating {
            inner.chain.push_back(notifier);
        } else {
            drop(inner);
            notifier.trigger();
        }
    }

    pub(crate) fn annotate(&self, file: &'static str, line: u32) {
        self.inner.borrow_mut().annotation = Some(Annotation { file, line });
    }

    fn deliver(binding: Binding) {
        if let Some(core) = binding.rendezvous.upgrade() {
            let waker = {
                let mut core = core.borrow_mut();
                core.remove(binding.key);
                core.complete(binding.rid)
            };
            if let Some(waker) = waker {
                waker();
            }
        }
    }

    fn propagate_chain(&self) {
        self.inner.borrow_mut().propagating = true;
        loop {
            let next = self.inner.borrow_mut().chain.pop_front();
            match next {
                Some(notifier) => {
                    notifier.trigger();
                }
                None => break,
            }
        }
        self.inner.borrow_mut().propagating = false;
    }
}

impl Drop for SimpleEvent {
    fn drop(&mut self) {
        // Last reference gone. A still-active occurrence is unblocked
        // exactly once before deallocation.
        let binding = match self.inner.borrow_mut().binding.take() {
            Some(binding) => binding,
            None => return,
        };
        let silent = binding
            .rendezvous
            .upgrade()
            .is_none_or(|core| core.borrow().volatile);
        if !silent {
            report_leak(self.inner.borrow().annotation);
        }
        Self::deliver(binding);
        self.propagate_chain();
    }
}

/// A shared write-once destination for an event's trigger value.
///
/// The waiter keeps one handle and reads with [`take`](Slot::take) after the
/// completion arrives; the event keeps another and writes on trigger.
pub struct Slot<T>(Rc<RefCell<Option<T>>>);

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    pub fn set(&self, value: T) {
        *self.0.borrow_mut() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.0.borrow_mut().take()
    }

    pub fn is_set(&self) -> bool {
        self.0.borrow().is_some()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle onto a single-shot occurrence, optionally carrying a value slot.
///
/// Created on a [`Rendezvous`](crate::rendezvous::Rendezvous); a
/// default-constructed handle refers to the immortal empty occurrence and
/// triggering it does nothing.
pub struct Event<T = ()> {
    simple: Rc<SimpleEvent>,
    slot: Option<Slot<T>>,
}

impl<T> Event<T> {
    pub(crate) fn from_parts(simple: Rc<SimpleEvent>, slot: Option<Slot<T>>) -> Self {
        Self { simple, slot }
    }

    /// An empty handle; triggering it is a no-op.
    pub fn dead() -> Self {
        Self {
            simple: SimpleEvent::make_dead(),
            slot: None,
        }
    }

    /// True once the occurrence has triggered or been cancelled.
    pub fn empty(&self) -> bool {
        self.simple.empty()
    }

    /// Trigger the occurrence with `value`. The slot is written only when
    /// this call actually fired the occurrence; on an empty event nothing
    /// happens.
    pub fn trigger(&self, value: T) {
        if self.simple.trigger() {
            if let Some(slot) = &self.slot {
                slot.set(value);
            }
        }
    }

    /// Trigger the occurrence without touching its slot.
    pub fn unblock(&self) {
        self.simple.trigger();
    }

    /// Fire `notifier` right after this occurrence. On an empty event the
    /// notifier fires immediately. Takes ownership of one reference.
    pub fn at_trigger(&self, notifier: Event) {
        self.simple.at_trigger(notifier.into_simple());
    }

    /// A slot-less handle for the same occurrence.
    pub fn bind_all(&self) -> Event {
        Event {
            simple: self.simple.clone(),
            slot: None,
        }
    }

    /// Override the source position reported if this event leaks.
    pub fn annotate(&self, file: &'static str, line: u32) {
        self.simple.annotate(file, line);
    }

    pub(crate) fn into_simple(self) -> Rc<SimpleEvent> {
        self.simple
    }

    #[cfg(test)]
    pub(crate) fn simple(&self) -> &Rc<SimpleEvent> {
        &self.simple
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            simple: self.simple.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::dead()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("empty", &self.empty())
            .field("has_slot", &self.slot.is_some())
            .finish()
    }
}
