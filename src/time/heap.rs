//! Min-heap of scheduled calls.
//!
//! Entries are ordered by `(time, seq)`. Every insertion takes a fresh
//! sequence number, so calls with equal fire times run in the order they
//! were scheduled, reset or delayed. Rescheduling pushes a new entry and
//! leaves the old one in place; an entry is stale once its call is no longer
//! pending or its sequence number is no longer the call's current one, and
//! stale entries are discarded when they reach the top. Once stale entries
//! outnumber half the live ones (and there are more than
//! [`COMPACT_THRESHOLD`] of them) the heap is rebuilt without them, so
//! repeated resets and cancellations of far-off calls stay bounded.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

use super::delayed_call::CallShared;
use crate::types::Time;

/// Minimum number of stale entries before the heap is rebuilt.
pub(crate) const COMPACT_THRESHOLD: usize = 50;

struct Entry {
    time: Time,
    seq: u64,
    call: Rc<CallShared>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.call.is_pending() && self.call.seq.get() == self.seq
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest time first).
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending calls ordered by fire time.
#[derive(Default)]
pub(crate) struct CallQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    live: usize,
    stale: usize,
}

impl CallQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of pending calls.
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn push_entry(&mut self, call: Rc<CallShared>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        call.seq.set(seq);
        self.heap.push(Entry {
            time: call.time.get(),
            seq,
            call,
        });
    }

    /// Adds a newly scheduled call.
    pub(crate) fn insert(&mut self, call: Rc<CallShared>) {
        self.live += 1;
        self.push_entry(call);
    }

    /// Moves a pending call to `time`, behind every call already queued for it.
    pub(crate) fn reschedule(&mut self, call: &Rc<CallShared>, time: Time) {
        call.time.set(time);
        self.push_entry(Rc::clone(call));
        self.mark_stale();
    }

    /// Accounts for a call cancelled through its handle.
    pub(crate) fn forget(&mut self) {
        self.live = self.live.saturating_sub(1);
        self.mark_stale();
    }

    /// Number of entries held, stale ones included.
    pub(crate) fn entries(&self) -> usize {
        self.heap.len()
    }

    fn mark_stale(&mut self) {
        self.stale += 1;
        if self.stale > COMPACT_THRESHOLD && self.stale > self.live / 2 {
            self.heap.retain(Entry::is_live);
            self.stale = 0;
        }
    }

    fn discard_stale(&mut self) {
        while self.heap.peek().is_some_and(|e| !e.is_live()) {
            self.heap.pop();
            self.stale = self.stale.saturating_sub(1);
        }
    }

    /// Returns the earliest pending fire time.
    pub(crate) fn peek_time(&mut self) -> Option<Time> {
        self.discard_stale();
        self.heap.peek().map(|e| e.time)
    }

    /// Pops the earliest pending call if it is due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Time) -> Option<Rc<CallShared>> {
        self.discard_stale();
        if self.heap.peek().is_some_and(|e| e.time <= now) {
            let entry = self.heap.pop()?;
            self.live = self.live.saturating_sub(1);
            Some(entry.call)
        } else {
            None
        }
    }

    /// Pending calls in fire order.
    pub(crate) fn snapshot(&self) -> Vec<Rc<CallShared>> {
        let mut live: Vec<&Entry> = self.heap.iter().filter(|e| e.is_live()).collect();
        live.sort_by_key(|e| (e.time, e.seq));
        live.into_iter().map(|e| Rc::clone(&e.call)).collect()
    }
}
