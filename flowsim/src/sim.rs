//! Discrete event simulator for flowlink networks.

use std::collections::BinaryHeap;

use flowlink::traits::test_impls::MemoryStore;
use flowlink::{Command, Duration, Error, Event, MacAddr, NodeId, Timestamp, BROADCAST_ADDR};
use hashbrown::HashMap;
use log::{debug, info};

use crate::event::{Event as SimEvent, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{NetworkSnapshot, RoundRecord, SimMetrics, SimulationResult};
use crate::node::SimNode;
use crate::topology::Topology;

/// Discrete event simulator for one coordinator and its sensor nodes.
pub struct Simulator {
    /// All nodes in the simulation.
    nodes: HashMap<NodeId, SimNode>,
    /// The coordinator, once added.
    coordinator: Option<NodeId>,
    /// Network topology.
    topology: Topology,
    /// Current simulation time.
    current_time: Timestamp,
    /// Priority queue of scheduled events.
    event_queue: BinaryHeap<ScheduledEvent>,
    /// Armed timer per node. Queued timer events at other times are stale.
    timers: HashMap<NodeId, Timestamp>,
    /// Start of the coordinator's pending round.
    round_started: Option<Timestamp>,
    /// Collected metrics.
    metrics: SimMetrics,
    /// Next sequence number for event ordering.
    next_seq: u64,
    /// RNG state for packet loss.
    rng_state: u64,
    /// Interval for automatic snapshots.
    snapshot_interval: Option<Duration>,
    /// Next snapshot time.
    next_snapshot: Option<Timestamp>,
}

impl Simulator {
    /// Create a new simulator with given RNG seed.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            coordinator: None,
            topology: Topology::new(),
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            timers: HashMap::new(),
            round_started: None,
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng_state: seed,
            snapshot_interval: None,
            next_snapshot: None,
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the snapshot interval for automatic pairing state recording.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.current_time + interval);
        self
    }

    /// Add the coordinator with an empty store.
    ///
    /// A simulation holds at most one coordinator; adding another replaces
    /// which node receives commands.
    pub fn add_coordinator(&mut self, id: NodeId) -> NodeId {
        self.add_coordinator_with_store(id, MemoryStore::new())
    }

    /// Add the coordinator booting from a pre-filled store.
    pub fn add_coordinator_with_store(&mut self, id: NodeId, store: MemoryStore) -> NodeId {
        let node = SimNode::coordinator_with_store(id, store, self.current_time);
        self.coordinator = Some(id);
        self.add_node_internal(node)
    }

    /// Add a sensor node with `sensor_count` flow sensors. It starts searching at once.
    pub fn add_sensor_node(&mut self, id: NodeId, sensor_count: usize) -> Result<NodeId, Error> {
        let node = SimNode::sensor(id, sensor_count, self.current_time)?;
        Ok(self.add_node_internal(node))
    }

    fn add_node_internal(&mut self, mut node: SimNode) -> NodeId {
        let node_id = node.node_id();
        node.start(self.current_time);
        self.nodes.insert(node_id, node);
        self.after_activity(node_id);
        node_id
    }

    pub fn node(&self, id: &NodeId) -> Option<&SimNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut SimNode> {
        self.nodes.get_mut(id)
    }

    /// All node IDs in address order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn coordinator_id(&self) -> Option<NodeId> {
        self.coordinator
    }

    /// The coordinator node.
    pub fn coordinator(&self) -> Option<&SimNode> {
        self.coordinator.and_then(|id| self.nodes.get(&id))
    }

    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    /// Schedule an event.
    pub fn schedule(&mut self, time: Timestamp, event: SimEvent) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, SimEvent::ScenarioAction(action));
    }

    /// Schedule a coordinator command.
    pub fn schedule_command(&mut self, time: Timestamp, command: Command) {
        self.schedule(time, SimEvent::Command(command));
    }

    /// Schedule `count` pulses on one sensor, `period` apart, starting at `start`.
    pub fn schedule_pulses(
        &mut self,
        node: NodeId,
        sensor: usize,
        start: Timestamp,
        period: Duration,
        count: usize,
    ) {
        let mut time = start;
        for _ in 0..count {
            self.schedule(time, SimEvent::Pulse { node, sensor });
            time += period;
        }
    }

    /// Run simulation until specified time.
    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while let Some(event) = self.event_queue.peek() {
            if event.time > end_time {
                break;
            }
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
            self.maybe_take_snapshot();
        }

        // Advance to end_time even if no more events
        self.advance_time(end_time);
        self.take_snapshot();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.peek().is_none(),
        }
    }

    /// Run simulation for specified duration.
    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    /// Run until event queue is empty or max events processed.
    pub fn run_events(&mut self, max_events: usize) -> SimulationResult {
        let mut processed = 0;

        while let Some(event) = self.event_queue.pop() {
            self.advance_time(event.time);
            self.process_event(event.event);

            processed += 1;
            if processed >= max_events {
                break;
            }

            self.maybe_take_snapshot();
        }

        self.take_snapshot();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.is_empty(),
        }
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: SimEvent) {
        match event {
            SimEvent::MessageDelivery { from, to, data } => {
                self.deliver_message(from, to, data);
            }
            SimEvent::TimerFire { node } => {
                self.fire_timer(node);
            }
            SimEvent::Command(command) => {
                self.run_command(command);
            }
            SimEvent::Pulse { node, sensor } => {
                self.pulse(node, sensor);
            }
            SimEvent::ScenarioAction(action) => {
                self.execute_action(action);
            }
        }
    }

    fn deliver_message(&mut self, from: NodeId, to: NodeId, data: Vec<u8>) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        node.handle_transport_rx(&from, &data, now);
        self.metrics.messages_delivered += 1;
        self.after_activity(to);
    }

    fn fire_timer(&mut self, node_id: NodeId) {
        let now = self.current_time;
        if self.timers.get(&node_id) != Some(&now) {
            // Superseded by an earlier re-arm.
            return;
        }
        self.timers.remove(&node_id);

        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.handle_timer(now);
        }
        self.after_activity(node_id);
    }

    fn run_command(&mut self, command: Command) {
        let now = self.current_time;
        let Some(id) = self.coordinator else {
            debug!("no coordinator for {:?}", command);
            return;
        };

        match command {
            Command::StartRound => self.round_started = Some(now),
            Command::CancelRound => self.round_started = None,
            _ => {}
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.handle_command(command, now);
        }
        self.after_activity(id);
    }

    fn pulse(&mut self, node_id: NodeId, sensor: usize) {
        let counted = self
            .nodes
            .get(&node_id)
            .is_some_and(|node| node.register_pulse(sensor, self.current_time));
        if counted {
            self.metrics.pulses_counted += 1;
        }
    }

    /// Route a node's queued frames, record its events and re-arm its timer.
    fn after_activity(&mut self, node_id: NodeId) {
        self.collect_outgoing(node_id);
        self.collect_events(node_id);
        self.arm_timer(node_id);
    }

    fn collect_outgoing(&mut self, sender: NodeId) {
        let frames = match self.nodes.get(&sender) {
            Some(node) => node.take_outgoing(),
            None => return,
        };

        for (to, frame) in frames {
            self.route_message(sender, to, frame);
        }
    }

    fn collect_events(&mut self, node_id: NodeId) {
        let events = match self.nodes.get(&node_id) {
            Some(node) => node.take_events(),
            None => return,
        };

        let now = self.current_time;
        for event in events {
            if let Event::RoundComplete { readings } = &event {
                let started_at = self.round_started.take().unwrap_or(now);
                info!(
                    "round complete at {}ms with {} readings",
                    now.as_millis(),
                    readings.count()
                );
                self.metrics.record_round(RoundRecord {
                    started_at,
                    completed_at: now,
                    readings: readings.clone(),
                });
            }
            self.metrics.record_event(now, node_id, event);
        }
    }

    /// Keep the earliest of the armed timer and the node's next wake.
    fn arm_timer(&mut self, node_id: NodeId) {
        let now = self.current_time;
        let Some(wake) = self.nodes.get(&node_id).map(|n| n.next_wake(now).max(now)) else {
            return;
        };
        if self.timers.get(&node_id).is_some_and(|&armed| armed <= wake) {
            return;
        }
        self.timers.insert(node_id, wake);
        self.schedule(wake, SimEvent::TimerFire { node: node_id });
    }

    /// Unicast goes to `to` if linked; broadcast reaches every active neighbor.
    fn route_message(&mut self, sender: NodeId, to: NodeId, data: Vec<u8>) {
        self.metrics.messages_sent += 1;

        let targets = if to == BROADCAST_ADDR {
            self.topology.neighbors(sender)
        } else {
            vec![to]
        };

        let mut deliveries = Vec::with_capacity(targets.len());
        let mut dropped_count = 0u64;

        for target in targets {
            let (active, loss_rate, delay) = match self.topology.get_link(sender, target) {
                Some(link) => (link.active, link.loss_rate, link.delay),
                None => (false, 0.0, Duration::ZERO),
            };
            if !active {
                debug!("{} unreachable from {}", MacAddr(target), MacAddr(sender));
                dropped_count += 1;
                continue;
            }
            if loss_rate > 0.0 && self.random_f64() < loss_rate {
                dropped_count += 1;
                continue;
            }
            deliveries.push((target, delay));
        }

        self.metrics.messages_dropped += dropped_count;

        let current_time = self.current_time;
        for (target, delay) in deliveries {
            self.schedule(
                current_time + delay,
                SimEvent::MessageDelivery {
                    from: sender,
                    to: target,
                    data: data.clone(),
                },
            );
        }
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        info!("t={}ms {:?}", self.current_time.as_millis(), action);
        match action {
            ScenarioAction::Partition { groups } => {
                self.topology.partition(&groups);
            }
            ScenarioAction::HealPartition => {
                self.topology.heal();
            }
            ScenarioAction::DisableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { from, to, rate } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::SetDelay { from, to, delay } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.delay = delay;
                }
            }
            ScenarioAction::TakeSnapshot => {
                self.take_snapshot();
            }
        }
    }

    fn maybe_take_snapshot(&mut self) {
        if let Some(next) = self.next_snapshot {
            if self.current_time >= next {
                self.take_snapshot();
                if let Some(interval) = self.snapshot_interval {
                    self.next_snapshot = Some(next + interval);
                }
            }
        }
    }

    /// Record the coordinator's peer set and every sensor node's binding.
    pub fn take_snapshot(&mut self) {
        let mut snapshot = NetworkSnapshot::new(self.current_time);

        if let Some(coordinator) = self.coordinator().and_then(|n| n.as_coordinator()) {
            snapshot.mode = Some(coordinator.mode());
            snapshot.peers = coordinator.peers().iter().copied().collect();
        }
        for (node_id, node) in &self.nodes {
            if !node.is_coordinator() {
                snapshot.record_sensor(*node_id, node.bound_to());
            }
        }

        self.metrics.add_snapshot(snapshot);
    }

    /// Generate a random f64 in [0, 1).
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state as f64) / (u64::MAX as f64)
    }
}
