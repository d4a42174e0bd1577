//! Event types and priority queue for discrete event simulation.

use std::cmp::Ordering;

use flowlink::{Command, Duration, NodeId, Timestamp};

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
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Partition the network into isolated groups.
    Partition { groups: Vec<Vec<NodeId>> },
    /// Heal all partitions (restore full connectivity).
    HealPartition,
    /// Disable a specific link.
    DisableLink { from: NodeId, to: NodeId },
    /// Enable a specific link.
    EnableLink { from: NodeId, to: NodeId },
    /// Set loss rate on a link.
    SetLossRate { from: NodeId, to: NodeId, rate: f64 },
    /// Set propagation delay on a link.
    SetDelay {
        from: NodeId,
        to: NodeId,
        delay: Duration,
    },
    /// Record a network snapshot for metrics.
    TakeSnapshot,
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// Deliver a datagram to a node.
    MessageDelivery {
        from: NodeId,
        to: NodeId,
        data: Vec<u8>,
    },
    /// Fire the timer for a node.
    TimerFire { node: NodeId },
    /// Hand a command to the coordinator.
    Command(Command),
    /// A flow sensor on a sensor node sees one edge.
    Pulse { node: NodeId, sensor: usize },
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

// Min-heap ordering: BinaryHeap is a max-heap, so comparisons are reversed.
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
        match other.time.cmp(&self.time) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    const NODE: NodeId = [0x24, 0x6F, 0x28, 0, 0, 1];

    #[test]
    fn test_event_ordering() {
        let e1 = ScheduledEvent::new(
            Timestamp::from_secs(10),
            SequenceNumber::new(1),
            Event::TimerFire { node: NODE },
        );
        let e2 = ScheduledEvent::new(
            Timestamp::from_secs(5),
            SequenceNumber::new(2),
            Event::TimerFire { node: NODE },
        );

        // Earlier time is "greater" in min-heap terms
        assert!(e2 > e1);
    }

    #[test]
    fn test_same_time_pops_in_schedule_order() {
        let mut heap = BinaryHeap::new();
        for seq in [3, 1, 2] {
            heap.push(ScheduledEvent::new(
                Timestamp::from_millis(250),
                SequenceNumber::new(seq),
                Event::Pulse {
                    node: NODE,
                    sensor: seq as usize,
                },
            ));
        }
        heap.push(ScheduledEvent::new(
            Timestamp::from_millis(100),
            SequenceNumber::new(9),
            Event::Command(Command::StartRound),
        ));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.seq.value())
            .collect();
        assert_eq!(order, [9, 1, 2, 3]);
    }
}
