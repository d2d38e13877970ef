//! # Event Scheduler
//!
//! Discrete-event clock and ordered delivery queue. All message
//! deliveries and protocol timers flow through one `BTreeMap` keyed by
//! `(time, seq)`, where `seq` is a monotone counter assigned at
//! scheduling time. Two events due at the same instant therefore pop
//! in the order they were scheduled, which keeps runs byte-for-byte
//! reproducible under a fixed seed.

use std::collections::{BTreeMap, HashMap};

use crate::{Envelope, Height, NodeId, SimTime, ViewNumber};

/// Total order over scheduled events: time first, then send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: SimTime,
    pub seq: u64,
}

/// Protocol timers a node can arm. Cancelled by key, so re-arming the
/// same timer for a later view replaces nothing; each (height, view)
/// gets its own slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolTimer {
    /// Round timeout: fires if the view has not finalized in time.
    Round { height: Height, view: ViewNumber },
}

#[derive(Debug, Clone)]
pub enum ScheduledEvent {
    Deliver(Envelope),
    Timer { node: NodeId, timer: ProtocolTimer },
}

/// The simulation's single source of time.
#[derive(Debug, Default)]
pub struct Scheduler {
    now: SimTime,
    seq: u64,
    queue: BTreeMap<EventKey, ScheduledEvent>,
    timers: HashMap<(NodeId, ProtocolTimer), EventKey>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queue a message for delivery after `delay`. Stamps the
    /// envelope's delivery time.
    pub fn schedule_delivery(&mut self, mut env: Envelope, delay: SimTime) -> EventKey {
        let key = self.next_key(delay);
        env.delivered_at = key.time;
        self.queue.insert(key, ScheduledEvent::Deliver(env));
        key
    }

    /// Arm a timer owned by `node`. An already-armed timer with the
    /// same identity is replaced.
    pub fn schedule_timer(&mut self, node: NodeId, timer: ProtocolTimer, after: SimTime) -> EventKey {
        if let Some(old) = self.timers.remove(&(node, timer)) {
            self.queue.remove(&old);
        }
        let key = self.next_key(after);
        self.queue.insert(key, ScheduledEvent::Timer { node, timer });
        self.timers.insert((node, timer), key);
        key
    }

    /// Disarm a timer before it fires. Returns whether it was armed.
    pub fn cancel_timer(&mut self, node: NodeId, timer: ProtocolTimer) -> bool {
        match self.timers.remove(&(node, timer)) {
            Some(key) => self.queue.remove(&key).is_some(),
            None => false,
        }
    }

    /// Pop the next event and advance the clock to its due time.
    pub fn pop_next(&mut self) -> Option<(SimTime, ScheduledEvent)> {
        let (key, event) = self.queue.pop_first()?;
        debug_assert!(key.time >= self.now, "scheduler time went backwards");
        self.now = key.time;
        if let ScheduledEvent::Timer { node, timer } = &event {
            self.timers.remove(&(*node, *timer));
        }
        Some((key.time, event))
    }

    /// Due time of the next event, if any.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.queue.keys().next().map(|k| k.time)
    }

    /// Drop every pending event and timer. The clock keeps its value.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.timers.clear();
    }

    fn next_key(&mut self, delay: SimTime) -> EventKey {
        let key = EventKey {
            time: self.now + delay,
            seq: self.seq,
        };
        self.seq += 1;
        key
    }
}
