//! Event types and priority queue for discrete event simulation.

use std::cmp::Ordering;

use aggtree::{Addr, Command, Timestamp};

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Scenario actions that can be scheduled during simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioAction {
    /// Partition the network into isolated groups.
    Partition { groups: Vec<Vec<Addr>> },
    /// Heal all partitions (restore full connectivity).
    HealPartition,
    /// Disable the link between two nodes.
    DisableLink { a: Addr, b: Addr },
    /// Enable the link between two nodes.
    EnableLink { a: Addr, b: Addr },
    /// Set the loss rate of the link between two nodes.
    SetLossRate { a: Addr, b: Addr, rate: f64 },
    /// Record a tree snapshot.
    TakeSnapshot,
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Deliver a frame to a node.
    FrameDelivery {
        to: Addr,
        data: Vec<u8>,
        rssi: Option<i16>,
        from: Addr,
    },
    /// Process a node's timers.
    ///
    /// `at` is the wakeup this event was scheduled for; events superseded by
    /// a later reschedule are ignored.
    TimerFire { node: Addr, at: Timestamp },
    /// Hand an application command to a node.
    Command { node: Addr, command: Command },
    /// Execute a scenario action.
    ScenarioAction(ScenarioAction),
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    /// When the event should occur.
    pub time: Timestamp,
    /// Sequence number for deterministic ordering of same-time events.
    pub seq: SequenceNumber,
    /// The event to process.
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: Timestamp, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

// BinaryHeap is a max-heap; reverse the ordering to pop the earliest event.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    fn timer(node: Addr, ms: u64, seq: u64) -> ScheduledEvent {
        let at = Timestamp::from_millis(ms);
        ScheduledEvent::new(at, SequenceNumber::new(seq), Event::TimerFire { node, at })
    }

    #[test]
    fn test_earlier_event_pops_first() {
        let mut heap = BinaryHeap::new();
        heap.push(timer(1, 500, 0));
        heap.push(timer(2, 100, 1));
        heap.push(timer(3, 300, 2));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.time.as_millis())
            .collect();
        assert_eq!(order, [100, 300, 500]);
    }

    #[test]
    fn test_same_time_keeps_schedule_order() {
        let first = timer(1, 10, 1);
        let second = timer(2, 10, 2);
        assert!(first > second);

        let mut heap = BinaryHeap::from([second, first]);
        assert_eq!(heap.pop().map(|e| e.seq.value()), Some(1));
    }
}
