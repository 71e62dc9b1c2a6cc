use crate::event::SimpleEvent;
use std::mem;
use std::rc::Rc;
use std::time::Instant;

const ARITY: usize = 4;
const FIRST_CAPACITY: usize = 31;

/// One scheduled deadline. Records with the same deadline fire in insertion
/// order, so the key is the `(when, order)` pair.
struct TimerRecord {
    when: Instant,
    order: u64,
    event: Rc<SimpleEvent>,
}

impl TimerRecord {
    #[inline(always)]
    fn key(&self) -> (Instant, u64) {
        (self.when, self.order)
    }
}

/// Four-ary min-heap of timer records with lazy culling.
///
/// A record whose event went empty elsewhere (cancelled, triggered through
/// another path, disowned) stays in the heap under its old key and is
/// evicted opportunistically: trailing empties are dropped before a push,
/// sift-up routes around an empty parent by pulling its smallest child up,
/// and pops re-cull the root. Random-access deletion is never needed.
///
/// Layout: the root's children are slots 1..4; thereafter slot `i` has
/// children `4i..4i+4` and parent `i / 4`.
pub(crate) struct TimerSet {
    records: Vec<TimerRecord>,
    order: u64,
}

impl TimerSet {
    pub(crate) fn new() -> Self {
        Self {
            records: Vec::new(),
            order: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Deadline of the top record. Call [`cull`](Self::cull) first if an
    /// empty top would distort the answer.
    #[inline(always)]
    pub(crate) fn expiry(&self) -> Option<Instant> {
        self.records.first().map(|record| record.when)
    }

    pub(crate) fn push(&mut self, when: Instant, event: Rc<SimpleEvent>) {
        while self.records.last().is_some_and(|r| r.event.empty()) {
            self.records.pop();
        }
        if self.records.len() == self.records.capacity() {
            let ncap = if self.records.capacity() == 0 {
                FIRST_CAPACITY
            } else {
                self.records.capacity() * 4 + 3
            };
            self.records.reserve_exact(ncap - self.records.len());
        }
        self.order += 1;
        self.records.push(TimerRecord {
            when,
            order: self.order,
            event,
        });
        self.sift_up(self.records.len() - 1);
    }

    /// Pop the top record and fire its event, then restore heap order.
    pub(crate) fn pop_trigger(&mut self) {
        if let Some(event) = self.remove_top() {
            event.trigger();
            self.cull();
        }
    }

    /// Evict empty records from the top until an active one (or nothing)
    /// remains.
    pub(crate) fn cull(&mut self) {
        while self.records.first().is_some_and(|r| r.event.empty()) {
            let _ = self.remove_top();
        }
    }

    fn remove_top(&mut self) -> Option<Rc<SimpleEvent>> {
        if self.records.is_empty() {
            return None;
        }
        let last = self.records.len() - 1;
        self.records.swap(0, last);
        let record = self.records.pop();
        if !self.records.is_empty() {
            self.sift_down(0);
        }
        record.map(|r| r.event)
    }

    fn sift_up(&mut self, mut i: usize) {
        while i != 0 {
            let parent = i / ARITY;
            if self.records[parent].event.empty() {
                // Pull the smallest of the empty parent's children into its
                // slot, pushing the empty record toward the leaves.
                let (first, last) = Self::child_span(parent, self.records.len());
                let mut smallest = first;
                for child in first + 1..last {
                    if self.records[child].key() < self.records[smallest].key() {
                        smallest = child;
                    }
                }
                self.records[parent].when = self.records[smallest].when;
                self.records[parent].order = self.records[smallest].order;
                let (head, tail) = self.records.split_at_mut(smallest);
                mem::swap(&mut head[parent].event, &mut tail[0].event);
                if smallest != i {
                    break;
                }
                // The new record moved up a level; keep sifting from there.
                i = parent;
            } else if self.records[i].key() < self.records[parent].key() {
                self.records.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let (first, last) = Self::child_span(i, self.records.len());
            let mut smallest = i;
            for child in first..last {
                if self.records[child].key() < self.records[smallest].key() {
                    smallest = child;
                }
            }
            if smallest == i {
                return;
            }
            self.records.swap(i, smallest);
            i = smallest;
        }
    }

    #[inline(always)]
    fn child_span(i: usize, len: usize) -> (usize, usize) {
        let first = if i == 0 { 1 } else { i * ARITY };
        let last = (first + ARITY - usize::from(i == 0)).min(len);
        (first, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::Rendezvous;
    use std::time::Duration;

    fn base() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_pop_order_follows_deadlines() {
        let r = Rendezvous::new();
        let t0 = base();
        let mut timers = TimerSet::new();
        timers.push(t0 + Duration::from_millis(30), r.make_event_id(3).into_simple());
        timers.push(t0 + Duration::from_millis(10), r.make_event_id(1).into_simple());
        timers.push(t0 + Duration::from_millis(20), r.make_event_id(2).into_simple());
        assert_eq!(timers.expiry(), Some(t0 + Duration::from_millis(10)));
        for expect in 1..=3 {
            timers.pop_trigger();
            assert_eq!(r.join_id(), Some(expect));
        }
        assert!(timers.is_empty());
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let r = Rendezvous::new();
        let when = base() + Duration::from_millis(5);
        let mut timers = TimerSet::new();
        for i in 0..8 {
            timers.push(when, r.make_event_id(i).into_simple());
        }
        for expect in 0..8 {
            timers.pop_trigger();
            assert_eq!(r.join_id(), Some(expect));
        }
    }

    #[test]
    fn test_heap_order_across_many_interleaved_pushes() {
        let r = Rendezvous::new();
        let t0 = base();
        let mut timers = TimerSet::new();
        // Deliberately scrambled offsets, enough to exercise three heap levels.
        let offsets = [
            17, 3, 29, 11, 5, 23, 2, 31, 13, 7, 19, 37, 1, 41, 9, 27, 15, 33, 4, 21,
        ];
        for (i, off) in offsets.iter().enumerate() {
            timers.push(
                t0 + Duration::from_millis(*off),
                r.make_event_id(i as u32).into_simple(),
            );
        }
        let mut sorted: Vec<_> = offsets.iter().enumerate().collect();
        sorted.sort_by_key(|(i, off)| (**off, *i));
        for (i, _) in sorted {
            timers.pop_trigger();
            assert_eq!(r.join_id(), Some(i as u32));
        }
        assert!(timers.is_empty());
    }

    #[test]
    fn test_push_drops_trailing_empty_records() {
        let r = Rendezvous::new();
        let t0 = base();
        let mut timers = TimerSet::new();
        let stale: Vec<_> = (0..4).map(|_| r.make_event()).collect();
        for (i, e) in stale.iter().enumerate() {
            timers.push(
                t0 + Duration::from_secs(10 + i as u64),
                e.clone().into_simple(),
            );
        }
        for e in &stale {
            e.bind_all().trigger(());
        }
        while r.join().is_some() {}
        assert_eq!(timers.len(), 4);
        // Every record deeper in the heap is empty, so this push clears them.
        timers.push(t0 + Duration::from_secs(1), r.make_event_id(9).into_simple());
        assert_eq!(timers.len(), 1);
        timers.pop_trigger();
        assert_eq!(r.join_id(), Some(9));
    }

    #[test]
    fn test_cull_releases_cancelled_records() {
        let r = Rendezvous::new();
        let t0 = base();
        let mut timers = TimerSet::new();
        timers.push(t0 + Duration::from_millis(10), r.make_event().into_simple());
        timers.push(t0 + Duration::from_millis(20), r.make_event().into_simple());
        drop(r);
        assert_eq!(timers.len(), 2);
        timers.cull();
        assert!(timers.is_empty());
    }

    #[test]
    fn test_sift_routes_around_empty_parent() {
        let r = Rendezvous::new();
        let t0 = base();
        let mut timers = TimerSet::new();
        let doomed = r.make_event_id(99);
        timers.push(t0 + Duration::from_millis(1), doomed.clone().into_simple());
        for i in 0..6 {
            timers.push(
                t0 + Duration::from_millis(20 + i),
                r.make_event_id(i as u32).into_simple(),
            );
        }
        // Empty the root in place, then push a record that must sift past it.
        doomed.bind_all().trigger(());
        assert_eq!(r.join_id(), Some(99));
        timers.push(t0 + Duration::from_millis(5), r.make_event_id(50).into_simple());
        timers.pop_trigger();
        assert_eq!(r.join_id(), Some(50));
        for expect in 0..6 {
            timers.pop_trigger();
            assert_eq!(r.join_id(), Some(expect));
        }
        assert!(timers.is_empty());
    }

    #[test]
    fn test_sift_continues_past_refilled_parent() {
        let r = Rendezvous::new();
        let t0 = base();
        let mut timers = TimerSet::new();
        let doomed = r.make_event_id(99);
        timers.push(t0 + Duration::from_millis(50), r.make_event_id(1).into_simple());
        timers.push(t0 + Duration::from_millis(100), doomed.clone().into_simple());
        timers.push(t0 + Duration::from_millis(60), r.make_event_id(2).into_simple());
        timers.push(t0 + Duration::from_millis(70), r.make_event_id(3).into_simple());
        doomed.bind_all().trigger(());
        assert_eq!(r.join_id(), Some(99));
        // Lands below the emptied slot, takes it over, and must keep
        // rising past the still-active root.
        timers.push(t0 + Duration::from_millis(5), r.make_event_id(9).into_simple());
        assert_eq!(timers.expiry(), Some(t0 + Duration::from_millis(5)));
        for expect in [9, 1, 2, 3] {
            timers.pop_trigger();
            assert_eq!(r.join_id(), Some(expect));
        }
        assert!(timers.is_empty());
    }

    #[test]
    fn test_pop_trigger_on_empty_heap_is_noop() {
        let mut timers = TimerSet::new();
        timers.pop_trigger();
        timers.cull();
        assert!(timers.is_empty());
    }

    #[test]
    fn test_capacity_growth_policy() {
        let r = Rendezvous::new();
        let t0 = base();
        let mut timers = TimerSet::new();
        timers.push(t0, r.make_event().into_simple());
        assert_eq!(timers.records.capacity(), 31);
        for i in 0..31 {
            timers.push(t0 + Duration::from_millis(i), r.make_event().into_simple());
        }
        assert_eq!(timers.records.capacity(), 127);
    }
}
