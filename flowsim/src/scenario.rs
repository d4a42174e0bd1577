//! Scenario builder for setting up and running simulations.
//!
//! Node indexes used by the builder count sensor nodes from 0. The
//! coordinator always has address [`COORDINATOR_ID`].

use flowlink::{Command, ConfigKind, Duration, MacAddr, ModuleMode, NodeId, Timestamp};
use log::warn;

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::sim::Simulator;
use crate::topology::Topology;

/// Address of the simulated coordinator.
pub const COORDINATOR_ID: NodeId = [0x24, 0x6F, 0x28, 0xC0, 0x00, 0x00];

/// Address of the `index`th simulated sensor node.
pub fn sensor_node_id(index: usize) -> NodeId {
    let [hi, lo] = (index as u16).to_be_bytes();
    [0x24, 0x6F, 0x28, 0x5E, hi, lo]
}

#[derive(Debug, Clone)]
enum TopologyType {
    /// Coordinator hub, sensor nodes only hear the coordinator.
    Star,
    /// Sensor nodes also hear each other's broadcasts.
    FullyConnected,
    Custom(Topology),
}

#[derive(Debug, Clone)]
struct PulseTrain {
    node: usize,
    sensor: usize,
    start: Timestamp,
    period: Duration,
    count: usize,
}

/// Builder for simulation scenarios.
pub struct ScenarioBuilder {
    /// Flow sensors on each sensor node.
    sensor_counts: Vec<usize>,
    /// RNG seed for determinism.
    seed: u64,
    topology_type: TopologyType,
    /// Global packet loss rate.
    loss_rate: f64,
    /// Link delay.
    delay: Duration,
    /// Pairing window opens at time zero.
    pairing_open: bool,
    /// Scheduled actions.
    actions: Vec<(Timestamp, ScenarioAction)>,
    /// Scheduled coordinator commands.
    commands: Vec<(Timestamp, Command)>,
    pulses: Vec<PulseTrain>,
    snapshot_interval: Option<Duration>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// A coordinator plus `num_sensor_nodes` nodes with one flow sensor each.
    ///
    /// Defaults: star topology, 1 ms lossless links, pairing window open
    /// from time zero.
    pub fn new(num_sensor_nodes: usize) -> Self {
        Self {
            sensor_counts: vec![1; num_sensor_nodes],
            seed: 42,
            topology_type: TopologyType::Star,
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            pairing_open: true,
            actions: Vec::new(),
            commands: Vec::new(),
            pulses: Vec::new(),
            snapshot_interval: None,
        }
    }

    /// Per-node flow sensor counts; the node count follows the list.
    pub fn with_sensor_counts(mut self, counts: Vec<usize>) -> Self {
        self.sensor_counts = counts;
        self
    }

    /// Same sensor count on every node.
    pub fn sensors_per_node(mut self, count: usize) -> Self {
        for c in &mut self.sensor_counts {
            *c = count;
        }
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Use a custom topology over [`COORDINATOR_ID`] and [`sensor_node_id`] addresses.
    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = TopologyType::Custom(topo);
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = TopologyType::Star;
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = TopologyType::FullyConnected;
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep the pairing window closed at start.
    pub fn pairing_closed(mut self) -> Self {
        self.pairing_open = false;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Schedule a coordinator command.
    pub fn command_at(mut self, time: Timestamp, command: Command) -> Self {
        self.commands.push((time, command));
        self
    }

    pub fn open_pairing_at(self, time: Timestamp) -> Self {
        self.command_at(time, Command::SetMode(ModuleMode::Pairing))
    }

    pub fn close_pairing_at(self, time: Timestamp) -> Self {
        self.command_at(time, Command::SetMode(ModuleMode::Running))
    }

    pub fn round_at(self, time: Timestamp) -> Self {
        self.command_at(time, Command::StartRound)
    }

    pub fn cancel_round_at(self, time: Timestamp) -> Self {
        self.command_at(time, Command::CancelRound)
    }

    /// Send one parameter to the given global sensor indexes.
    pub fn set_config_at(
        self,
        time: Timestamp,
        kind: ConfigKind,
        value: u16,
        indexes: Vec<usize>,
    ) -> Self {
        self.command_at(
            time,
            Command::SetConfig {
                kind,
                value,
                indexes,
            },
        )
    }

    pub fn remove_peer_at(self, time: Timestamp, node: usize) -> Self {
        self.command_at(time, Command::RemovePeer(sensor_node_id(node)))
    }

    /// Feed `count` pulses, `period` apart, to sensor `sensor` of node `node`.
    pub fn pulses(
        mut self,
        node: usize,
        sensor: usize,
        start: Timestamp,
        period: Duration,
        count: usize,
    ) -> Self {
        self.pulses.push(PulseTrain {
            node,
            sensor,
            start,
            period,
            count,
        });
        self
    }

    /// Schedule a network partition at the specified time.
    pub fn partition_at(mut self, time: Timestamp, groups: Vec<Vec<NodeId>>) -> Self {
        self.actions.push((time, ScenarioAction::Partition { groups }));
        self
    }

    /// Cut the listed sensor nodes off from everyone else.
    pub fn isolate_at(self, time: Timestamp, nodes: &[usize]) -> Self {
        let isolated: Vec<NodeId> = nodes.iter().map(|&i| sensor_node_id(i)).collect();
        let mut rest = vec![COORDINATOR_ID];
        rest.extend(
            (0..self.sensor_counts.len())
                .filter(|i| !nodes.contains(i))
                .map(sensor_node_id),
        );
        self.partition_at(time, vec![rest, isolated])
    }

    pub fn heal_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::HealPartition));
        self
    }

    /// Take the link between the coordinator and one sensor node down.
    pub fn disconnect_at(mut self, time: Timestamp, node: usize) -> Self {
        self.actions.push((
            time,
            ScenarioAction::DisableLink {
                from: COORDINATOR_ID,
                to: sensor_node_id(node),
            },
        ));
        self
    }

    pub fn reconnect_at(mut self, time: Timestamp, node: usize) -> Self {
        self.actions.push((
            time,
            ScenarioAction::EnableLink {
                from: COORDINATOR_ID,
                to: sensor_node_id(node),
            },
        ));
        self
    }

    /// Change the loss rate between the coordinator and one sensor node.
    pub fn loss_rate_at(mut self, time: Timestamp, node: usize, rate: f64) -> Self {
        self.actions.push((
            time,
            ScenarioAction::SetLossRate {
                from: COORDINATOR_ID,
                to: sensor_node_id(node),
                rate,
            },
        ));
        self
    }

    /// Change the delay between the coordinator and one sensor node.
    pub fn delay_at(mut self, time: Timestamp, node: usize, delay: Duration) -> Self {
        self.actions.push((
            time,
            ScenarioAction::SetDelay {
                from: COORDINATOR_ID,
                to: sensor_node_id(node),
                delay,
            },
        ));
        self
    }

    pub fn snapshot_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::TakeSnapshot));
        self
    }

    /// Build the simulator. Returns it with the sensor node addresses.
    ///
    /// Commands scheduled for the same instant run before anything the nodes
    /// do at that instant.
    pub fn build(self) -> (Simulator, Vec<NodeId>) {
        let mut sim = Simulator::new(self.seed);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }

        let sensor_ids: Vec<NodeId> = (0..self.sensor_counts.len()).map(sensor_node_id).collect();
        let mut all_ids = vec![COORDINATOR_ID];
        all_ids.extend_from_slice(&sensor_ids);

        // Custom topologies keep their own delays.
        let mut topo = match self.topology_type {
            TopologyType::Star => {
                let mut t = Topology::star(&all_ids);
                t.set_global_delay(self.delay);
                t
            }
            TopologyType::FullyConnected => {
                let mut t = Topology::fully_connected(&all_ids);
                t.set_global_delay(self.delay);
                t
            }
            TopologyType::Custom(t) => t,
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        sim = sim.with_topology(topo);

        if self.pairing_open {
            sim.schedule_command(Timestamp::ZERO, Command::SetMode(ModuleMode::Pairing));
        }
        for (time, command) in self.commands {
            sim.schedule_command(time, command);
        }
        for (time, action) in self.actions {
            sim.schedule_action(time, action);
        }
        for train in &self.pulses {
            if let Some(&node) = sensor_ids.get(train.node) {
                sim.schedule_pulses(node, train.sensor, train.start, train.period, train.count);
            }
        }

        sim.add_coordinator(COORDINATOR_ID);
        for (&id, &count) in sensor_ids.iter().zip(&self.sensor_counts) {
            if let Err(e) = sim.add_sensor_node(id, count) {
                warn!("sensor node {} not added: {}", MacAddr(id), e);
            }
        }

        (sim, sensor_ids)
    }

    pub fn run_for(self, duration: Duration) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_for(duration)
    }

    pub fn run_until(self, time: Timestamp) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_until(time)
    }
}

/// `num_sensor_nodes` single-sensor nodes around a coordinator, pairing open.
pub fn simple_scenario(num_sensor_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_sensor_nodes)
}

/// Like [`simple_scenario`] over links that lose `rate` of all frames.
pub fn lossy_scenario(num_sensor_nodes: usize, rate: f64) -> ScenarioBuilder {
    ScenarioBuilder::new(num_sensor_nodes).with_loss_rate(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_node_ids() {
        assert_eq!(sensor_node_id(0), [0x24, 0x6F, 0x28, 0x5E, 0, 0]);
        assert_eq!(sensor_node_id(258), [0x24, 0x6F, 0x28, 0x5E, 1, 2]);
        assert_ne!(sensor_node_id(0), COORDINATOR_ID);
    }

    #[test]
    fn test_scenario_builder_basic() {
        let (sim, nodes) = ScenarioBuilder::new(3).with_seed(123).build();

        assert_eq!(nodes.len(), 3);
        assert_eq!(sim.node_ids().len(), 4);
        assert_eq!(sim.coordinator_id(), Some(COORDINATOR_ID));
        assert_eq!(sim.topology().neighbors(COORDINATOR_ID), nodes);
        assert!(!sim.topology().is_connected(nodes[0], nodes[1]));
    }

    #[test]
    fn test_sensor_counts() {
        let (sim, nodes) = ScenarioBuilder::new(0)
            .with_sensor_counts(vec![2, 9, 10])
            .build();

        // The ten-sensor node is refused.
        assert_eq!(nodes.len(), 3);
        assert_eq!(sim.node_ids().len(), 3);
        let sensors = |i: usize| sim.node(&nodes[i]).unwrap().as_sensor().unwrap().sensors().len();
        assert_eq!(sensors(0), 2);
        assert_eq!(sensors(1), 9);
        assert!(sim.node(&nodes[2]).is_none());
    }

    #[test]
    fn test_scenario_with_loss_and_delay() {
        let (sim, nodes) = ScenarioBuilder::new(2)
            .with_loss_rate(0.5)
            .with_delay(Duration::from_millis(4))
            .build();

        let link = sim.topology().get_link(COORDINATOR_ID, nodes[1]).unwrap();
        assert_eq!(link.loss_rate, 0.5);
        assert_eq!(link.delay, Duration::from_millis(4));
    }

    #[test]
    fn test_isolate_keeps_others_connected() {
        let (mut sim, nodes) = ScenarioBuilder::new(3)
            .isolate_at(Timestamp::from_millis(500), &[1])
            .build();

        assert!(sim.topology().is_connected(COORDINATOR_ID, nodes[1]));
        sim.run_for(Duration::from_secs(1));

        assert!(sim.topology().is_connected(COORDINATOR_ID, nodes[0]));
        assert!(!sim.topology().is_connected(COORDINATOR_ID, nodes[1]));
        assert!(sim.topology().is_connected(COORDINATOR_ID, nodes[2]));
    }

    #[test]
    fn test_scenario_run_for() {
        let result = simple_scenario(2).run_for(Duration::from_secs(1));

        assert!(result.end_time >= Timestamp::from_secs(1));
        assert!(!result.metrics.snapshots.is_empty());
        assert!(result.all_paired());
    }
}
