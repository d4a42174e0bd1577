//! SimNode wrapper for simulated coordinator and sensor nodes.

use std::cell::{Cell, RefCell};
use std::future::{ready, Ready};

use embassy_sync::channel::Channel;
use flowlink::config::{DefaultConfig, NetworkConfig};
use flowlink::traits::test_impls::{MemoryStore, MockIndicator};
use flowlink::traits::TransportInChannel;
use flowlink::{
    Clock, Command, CoordinatorNode, Duration, Error, Event, NodeId, SensorConfig, SensorNode,
    SensorSampler, Timestamp, Transport,
};

/// Peer-table size of the simulated radio: 20 peers plus the broadcast slot.
pub const SIM_PEER_SLOTS: usize = 21;

/// Errors reported by [`SimTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimTransportError {
    /// Destination not in the peer table.
    NotPeer,
    /// Address already in the peer table.
    Exists,
    /// Peer table is full.
    Full,
}

/// Radio for simulation.
///
/// Enforces the peer table like a real ESP-NOW driver and queues frames for
/// the simulator to route.
pub struct SimTransport {
    peers: RefCell<Vec<NodeId>>,
    outgoing: RefCell<Vec<(NodeId, Vec<u8>)>>,
    incoming: TransportInChannel,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            peers: RefCell::new(Vec::new()),
            outgoing: RefCell::new(Vec::new()),
            incoming: Channel::new(),
        }
    }

    /// Take all queued frames in send order.
    pub fn take_sent(&self) -> Vec<(NodeId, Vec<u8>)> {
        std::mem::take(&mut *self.outgoing.borrow_mut())
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.peers.borrow().clone()
    }

    pub fn is_peer(&self, addr: &NodeId) -> bool {
        self.peers.borrow().contains(addr)
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    type Error = SimTransportError;

    fn send(&self, to: &NodeId, frame: &[u8]) -> Result<(), SimTransportError> {
        if !self.is_peer(to) {
            return Err(SimTransportError::NotPeer);
        }
        self.outgoing.borrow_mut().push((*to, frame.to_vec()));
        Ok(())
    }

    fn add_peer(&self, addr: &NodeId) -> Result<(), SimTransportError> {
        let mut peers = self.peers.borrow_mut();
        if peers.contains(addr) {
            return Err(SimTransportError::Exists);
        }
        if peers.len() >= SIM_PEER_SLOTS {
            return Err(SimTransportError::Full);
        }
        peers.push(*addr);
        Ok(())
    }

    fn remove_peer(&self, addr: &NodeId) -> Result<(), SimTransportError> {
        let mut peers = self.peers.borrow_mut();
        let pos = peers
            .iter()
            .position(|p| p == addr)
            .ok_or(SimTransportError::NotPeer)?;
        peers.remove(pos);
        Ok(())
    }

    fn incoming(&self) -> &TransportInChannel {
        &self.incoming
    }
}

/// Clock driven by the simulator.
pub struct SimClock {
    current: Cell<Timestamp>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::at(Timestamp::ZERO)
    }

    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Cell::new(time),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }

    pub fn advance(&self, duration: Duration) {
        self.current.set(self.current.get() + duration);
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Timestamp {
        self.current.get()
    }

    fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
        ready(())
    }
}

/// Simulated coordinator.
pub type SimCoordinator = CoordinatorNode<SimTransport, MemoryStore, SimClock, DefaultConfig>;

/// Flow sensor sized like the simulated nodes' config.
pub type SimSampler = SensorSampler<{ DefaultConfig::MAX_PULSES_PER_SENSOR }>;

/// Simulated sensor node.
pub type SimSensorNode = SensorNode<
    'static,
    SimTransport,
    SimClock,
    MockIndicator,
    DefaultConfig,
    { DefaultConfig::MAX_PULSES_PER_SENSOR },
>;

/// What a simulated node runs.
pub enum Role {
    Coordinator(Box<SimCoordinator>),
    Sensor(Box<SimSensorNode>),
}

/// A node in the simulation.
pub struct SimNode {
    id: NodeId,
    role: Role,
    /// When the node was created.
    pub created_at: Timestamp,
}

impl SimNode {
    /// A coordinator with an empty store.
    pub fn coordinator(id: NodeId, created_at: Timestamp) -> Self {
        Self::coordinator_with_store(id, MemoryStore::new(), created_at)
    }

    /// A coordinator booting from `store`, restoring whatever peer set it holds.
    pub fn coordinator_with_store(id: NodeId, store: MemoryStore, created_at: Timestamp) -> Self {
        let inner = CoordinatorNode::new(SimTransport::new(), store, SimClock::at(created_at));
        Self {
            id,
            role: Role::Coordinator(Box::new(inner)),
            created_at,
        }
    }

    /// A sensor node with `sensor_count` flow sensors at default settings.
    ///
    /// The samplers are leaked so they outlive the node, like the `static`s
    /// shared with the pulse interrupt on hardware.
    pub fn sensor(id: NodeId, sensor_count: usize, created_at: Timestamp) -> Result<Self, Error> {
        let samplers: Vec<SimSampler> = (0..sensor_count)
            .map(|_| SimSampler::new(SensorConfig::DEFAULT))
            .collect();
        let samplers: &'static [SimSampler] = Box::leak(samplers.into_boxed_slice());

        let inner = SensorNode::new(
            SimTransport::new(),
            SimClock::at(created_at),
            MockIndicator::default(),
            samplers,
        )?;
        Ok(Self {
            id,
            role: Role::Sensor(Box::new(inner)),
            created_at,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self.role, Role::Coordinator(_))
    }

    pub fn as_coordinator(&self) -> Option<&SimCoordinator> {
        match &self.role {
            Role::Coordinator(node) => Some(&**node),
            Role::Sensor(_) => None,
        }
    }

    pub fn as_coordinator_mut(&mut self) -> Option<&mut SimCoordinator> {
        match &mut self.role {
            Role::Coordinator(node) => Some(&mut **node),
            Role::Sensor(_) => None,
        }
    }

    pub fn as_sensor(&self) -> Option<&SimSensorNode> {
        match &self.role {
            Role::Sensor(node) => Some(&**node),
            Role::Coordinator(_) => None,
        }
    }

    /// The coordinator a sensor node is bound to.
    pub fn bound_to(&self) -> Option<NodeId> {
        self.as_sensor().and_then(|node| node.coordinator())
    }

    /// Begin operation. Sensor nodes start looking for a coordinator.
    pub fn start(&mut self, now: Timestamp) {
        if let Role::Sensor(node) = &mut self.role {
            node.clock().set(now);
            node.start(now);
        }
    }

    /// Handle an incoming datagram.
    pub fn handle_transport_rx(&mut self, from: &NodeId, data: &[u8], now: Timestamp) {
        // Handlers that read clock.now() must see simulated time
        match &mut self.role {
            Role::Coordinator(node) => {
                node.clock().set(now);
                node.handle_transport_rx(from, data, now);
            }
            Role::Sensor(node) => {
                node.clock().set(now);
                node.handle_transport_rx(from, data, now);
            }
        }
    }

    pub fn handle_timer(&mut self, now: Timestamp) {
        match &mut self.role {
            Role::Coordinator(node) => {
                node.clock().set(now);
                node.handle_timer(now);
            }
            Role::Sensor(node) => {
                node.clock().set(now);
                node.handle_timer(now);
            }
        }
    }

    /// Apply a command. Returns false on sensor nodes, which take none.
    pub fn handle_command(&mut self, cmd: Command, now: Timestamp) -> bool {
        match &mut self.role {
            Role::Coordinator(node) => {
                node.clock().set(now);
                node.handle_command(cmd, now);
                true
            }
            Role::Sensor(_) => false,
        }
    }

    /// Feed one edge to local sensor `sensor`. Returns whether it was counted.
    pub fn register_pulse(&self, sensor: usize, now: Timestamp) -> bool {
        self.as_sensor()
            .and_then(|node| node.sensors().get(sensor))
            .is_some_and(|sampler| sampler.register_pulse(now))
    }

    /// When the node next wants its timer.
    pub fn next_wake(&self, now: Timestamp) -> Timestamp {
        match &self.role {
            Role::Coordinator(node) => node.next_wake(now),
            Role::Sensor(node) => node.next_wake(now),
        }
    }

    /// Take all frames the node queued since the last call.
    pub fn take_outgoing(&self) -> Vec<(NodeId, Vec<u8>)> {
        match &self.role {
            Role::Coordinator(node) => node.transport().take_sent(),
            Role::Sensor(node) => node.transport().take_sent(),
        }
    }

    /// Drain the node's event channel.
    pub fn take_events(&self) -> Vec<Event> {
        let events = match &self.role {
            Role::Coordinator(node) => node.events(),
            Role::Sensor(node) => node.events(),
        };
        std::iter::from_fn(|| events.try_receive().ok()).collect()
    }
}
