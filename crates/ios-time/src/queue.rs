use std::collections::BTreeMap;

/// Handle returned by [`EventQueue::schedule`], usable with [`EventQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    tick: u64,
    seq: u64,
}

/// The scheduling half of an event queue, as seen by code that only needs to register work.
pub trait Scheduler<E> {
    /// Current virtual time.
    fn now(&self) -> u64;

    /// Register `event` to fire `delay` ticks from now.
    fn schedule(&mut self, delay: u64, event: E) -> EventId {
        let at = self.now().saturating_add(delay);
        self.schedule_at(at, event)
    }

    /// Register `event` to fire at absolute tick `tick` (clamped to `now`).
    fn schedule_at(&mut self, tick: u64, event: E) -> EventId;
}

/// Deterministic event queue keyed by `(tick, insertion sequence)`.
///
/// Events scheduled for the same tick fire in insertion order.
#[derive(Debug, Clone)]
pub struct EventQueue<E> {
    now: u64,
    next_seq: u64,
    events: BTreeMap<EventId, E>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: 0,
            next_seq: 0,
            events: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Tick of the earliest pending event.
    pub fn next_deadline(&self) -> Option<u64> {
        self.events.keys().next().map(|id| id.tick)
    }

    pub fn cancel(&mut self, id: EventId) -> Option<E> {
        self.events.remove(&id)
    }

    /// Pop the earliest event due at or before `limit`, advancing `now` to its tick.
    pub fn pop_due(&mut self, limit: u64) -> Option<(u64, E)> {
        let (&id, _) = self.events.iter().next()?;
        if id.tick > limit {
            return None;
        }
        let event = self.events.remove(&id)?;
        self.now = self.now.max(id.tick);
        Some((id.tick, event))
    }

    /// Move virtual time forward. Time never goes backwards.
    pub fn advance_to(&mut self, tick: u64) {
        self.now = self.now.max(tick);
    }

    /// Pending events in firing order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &E)> {
        self.events.iter().map(|(id, e)| (id.tick, e))
    }

    /// Keep only the pending events for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&E) -> bool) {
        self.events.retain(|_, e| keep(e));
    }

    /// Drop every pending event and reset the clock.
    pub fn reset(&mut self, now: u64) {
        self.events.clear();
        self.now = now;
        self.next_seq = 0;
    }
}

impl<E> Scheduler<E> for EventQueue<E> {
    fn now(&self) -> u64 {
        self.now
    }

    fn schedule_at(&mut self, tick: u64, event: E) -> EventId {
        let id = EventId {
            tick: tick.max(self.now),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.events.insert(id, event);
        id
    }
}
