//! Explicit timer set for host-side delivery.
//!
//! Timers are plain data: a deadline, the session generation that owns
//! them and an event. The host runtime sleeps until
//! [`Scheduler::next_deadline`] and then drains [`Scheduler::take_due`].
//! Closing a session is a single [`Scheduler::cancel_owner`] call.
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Timer<E> {
    due: Instant,
    owner: u64,
    event: E,
}

/// A fired timer.
#[derive(Debug, PartialEq, Eq)]
pub struct Fired<E> {
    pub id: TimerId,
    pub owner: u64,
    pub event: E,
}

#[derive(Debug)]
pub struct Scheduler<E> {
    next_id: u64,
    timers: BTreeMap<TimerId, Timer<E>>,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            timers: BTreeMap::new(),
        }
    }

    pub fn schedule(&mut self, owner: u64, due: Instant, event: E) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.timers.insert(id, Timer { due, owner, event });
        id
    }

    /// Returns true if the timer was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    /// Cancels every timer owned by `owner`; returns how many were dropped.
    pub fn cancel_owner(&mut self, owner: u64) -> usize {
        let before = self.timers.len();
        self.timers.retain(|_, t| t.owner != owner);
        before - self.timers.len()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn pending_for(&self, owner: u64) -> usize {
        self.timers.values().filter(|t| t.owner == owner).count()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.due).min()
    }

    /// Removes and returns every timer due at or before `now`, earliest
    /// first (ties in scheduling order).
    pub fn take_due(&mut self, now: Instant) -> Vec<Fired<E>> {
        let mut due_ids: Vec<(Instant, TimerId)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.due <= now)
            .map(|(id, t)| (t.due, *id))
            .collect();
        due_ids.sort();

        due_ids
            .into_iter()
            .filter_map(|(_, id)| {
                self.timers.remove(&id).map(|t| Fired {
                    id,
                    owner: t.owner,
                    event: t.event,
                })
            })
            .collect()
    }
}
