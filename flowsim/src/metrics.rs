//! Metrics collection for simulation analysis.

use flowlink::{Duration, Event, MergedReadings, ModuleMode, NodeId, Timestamp};
use hashbrown::HashMap;

/// Pairing state of the network at a point in time.
#[derive(Debug, Clone)]
pub struct NetworkSnapshot {
    /// When this snapshot was taken.
    pub time: Timestamp,
    /// Coordinator operating mode, if a coordinator exists.
    pub mode: Option<ModuleMode>,
    /// Coordinator peer set in index order.
    pub peers: Vec<NodeId>,
    /// Coordinator each sensor node is bound to.
    pub bindings: HashMap<NodeId, Option<NodeId>>,
}

impl NetworkSnapshot {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            mode: None,
            peers: Vec::new(),
            bindings: HashMap::new(),
        }
    }

    /// Record a sensor node's binding.
    pub fn record_sensor(&mut self, node_id: NodeId, coordinator: Option<NodeId>) {
        self.bindings.insert(node_id, coordinator);
    }

    /// Every sensor node is bound and the coordinator lists each of them.
    pub fn all_paired(&self) -> bool {
        self.bindings
            .iter()
            .all(|(node, bound)| bound.is_some() && self.peers.contains(node))
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.values().filter(|b| b.is_some()).count()
    }

    /// Sensor nodes still searching, in address order.
    pub fn unbound(&self) -> Vec<NodeId> {
        let mut result: Vec<NodeId> = self
            .bindings
            .iter()
            .filter(|(_, bound)| bound.is_none())
            .map(|(&id, _)| id)
            .collect();
        result.sort_unstable();
        result
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// One completed collection round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRecord {
    /// When the round was (last) started.
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
    pub readings: MergedReadings,
}

impl RoundRecord {
    /// Time from start to completion.
    pub fn latency(&self) -> Duration {
        self.completed_at - self.started_at
    }
}

/// An event a node published, stamped with when and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub time: Timestamp,
    pub node: NodeId,
    pub event: Event,
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Frames handed to the medium.
    pub messages_sent: u64,
    /// Frames lost to link loss or a missing/disabled link.
    pub messages_dropped: u64,
    /// Frames handed to a receiving node.
    pub messages_delivered: u64,
    /// Pulses counted by sensor samplers.
    pub pulses_counted: u64,
    /// Completed rounds in completion order.
    pub rounds: Vec<RoundRecord>,
    /// Every event published by any node.
    pub events: Vec<NodeEvent>,
    /// Snapshots taken at intervals.
    pub snapshots: Vec<NetworkSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: NetworkSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn record_round(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    pub fn record_event(&mut self, time: Timestamp, node: NodeId, event: Event) {
        self.events.push(NodeEvent { time, node, event });
    }

    /// Check if every sensor node was paired by the specified time.
    pub fn paired_by(&self, time: Timestamp) -> bool {
        self.snapshots
            .iter()
            .find(|s| s.time >= time)
            .is_some_and(|s| s.all_paired())
    }

    /// First snapshot time at which every sensor node was paired.
    pub fn pairing_time(&self) -> Option<Timestamp> {
        self.snapshots
            .iter()
            .find(|s| s.all_paired())
            .map(|s| s.time)
    }

    pub fn latest_snapshot(&self) -> Option<&NetworkSnapshot> {
        self.snapshots.last()
    }

    pub fn last_round(&self) -> Option<&RoundRecord> {
        self.rounds.last()
    }

    /// Peers the coordinator accepted, in pairing order with their index.
    pub fn pairings(&self) -> Vec<(NodeId, usize)> {
        self.events
            .iter()
            .filter_map(|e| match e.event {
                Event::PeerPaired { peer, index } => Some((peer, index)),
                _ => None,
            })
            .collect()
    }

    /// When `node` bound to a coordinator.
    pub fn bound_at(&self, node: &NodeId) -> Option<Timestamp> {
        self.events
            .iter()
            .find(|e| e.node == *node && matches!(e.event, Event::Bound { .. }))
            .map(|e| e.time)
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Final simulation time.
    pub end_time: Timestamp,
    /// Collected metrics.
    pub metrics: SimMetrics,
    /// Whether simulation ended due to event queue exhaustion (vs time limit).
    pub queue_exhausted: bool,
}

impl SimulationResult {
    /// Every sensor node ended up paired.
    pub fn all_paired(&self) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.all_paired())
    }

    pub fn final_peer_count(&self) -> usize {
        self.metrics
            .latest_snapshot()
            .map(|s| s.peer_count())
            .unwrap_or(0)
    }

    pub fn rounds_completed(&self) -> usize {
        self.metrics.rounds.len()
    }

    pub fn last_round(&self) -> Option<&RoundRecord> {
        self.metrics.last_round()
    }
}
