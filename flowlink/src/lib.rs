#![forbid(unsafe_code)]
//! flowlink - Flow-sensing star network over connectionless datagram radios
//!
//! One coordinator pairs with up to 20 sensor nodes over a single-hop,
//! ESP-NOW-style link. Each sensor node counts pulses from up to nine flow
//! sensors and reports a smoothed pulses-per-minute rate. The coordinator
//! collects every node's readings in rounds and fans configuration out to
//! individual sensors.
//!
//! This crate is `no_std` but **requires the `alloc` crate**. Collections are
//! heap-allocated with runtime-enforced capacity limits (see [`config`]).
//!
//! # Key Properties
//!
//! - Pairing is operator supervised: a single window flag gates new peers,
//!   known peers are always re-confirmed
//! - The peer set is persisted and restored on boot
//! - A round completes only once every peer has answered since it started;
//!   results merge in peer-index order, then local sensor order
//! - Pulse registration is interrupt safe; rates use packetized averaging
//! - Send failures are logged and counted, never returned
//!
//! # Example (basic usage)
//!
//! Mocks are behind the `test-support` feature.
//!
//! ```ignore
//! use flowlink::{CoordinatorNode, ModuleMode};
//! use flowlink::traits::test_impls::{MemoryStore, MockClock, MockTransport};
//!
//! let mut node = CoordinatorNode::<_, _, _>::new(
//!     MockTransport::new(),
//!     MemoryStore::new(),
//!     MockClock::new(),
//! );
//!
//! // Nothing persisted yet
//! assert_eq!(node.peer_count(), 0);
//! assert_eq!(node.mode(), ModuleMode::Running);
//!
//! // A round over no peers completes immediately
//! let merged = node.start_round(None).unwrap();
//! assert_eq!(merged.count(), 0);
//! ```
//!
//! # Example (sensor node)
//!
//! ```text
//! use flowlink::{SensorConfig, SensorNode, SensorSampler};
//!
//! static FLOW: [SensorSampler; 2] = [
//!     SensorSampler::new(SensorConfig::DEFAULT),
//!     SensorSampler::new(SensorConfig::DEFAULT),
//! ];
//!
//! // GPIO interrupt: FLOW[n].register_pulse(now());
//!
//! let mut node = SensorNode::<_, _, _>::new(transport, clock, led, &FLOW)?;
//! spawn(async move {
//!     node.run().await;
//! });
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Core types (NodeId, MessageType, SensorReading, Error, Event)
//! - [`wire`] - Frame codec
//! - [`traits`] - Transport, Clock, Store, Indicator traits
//! - [`link`] - Framing, peer admission and handler dispatch
//! - [`peers`] - Ordered, persisted peer set
//! - [`pairing`] - Coordinator side of pairing
//! - [`client`] - Sensor side of pairing
//! - [`aggregation`] - Collection rounds and configuration fan-out
//! - [`sampler`] - Pulse log and rate estimation
//! - [`responder`] - Sensor side of collection and configuration
//! - [`control`] - Operating mode, peer listing, index list parsing
//! - [`node`] - Coordinator and sensor node roles
//! - [`time`] - Timestamp and Duration types
//! - [`config`] - Compile-time capacities and runtime sensor parameters

#![no_std]

#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It includes mock transports and stores intended only for tests and simulation."
);

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod aggregation;
pub mod client;
pub mod collections;
pub mod config;
pub mod control;
pub mod link;
pub mod node;
pub mod pairing;
pub mod peers;
pub mod responder;
pub mod sampler;
pub mod time;
pub mod traits;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use aggregation::RoundCallback;
pub use config::{DefaultConfig, NetworkConfig, SensorConfig, SmallConfig, DEFAULT_MAX_PULSES};
pub use control::{ModuleMode, PeerInfo};
pub use node::{Command, CoordinatorNode, SensorNode};
pub use peers::PeerSet;
pub use sampler::SensorSampler;
pub use time::{Duration, Timestamp};
pub use traits::{Clock, Incoming, Indicator, Store, Transport};
pub use types::{
    ConfigKind, Error, Event, MacAddr, MergedReadings, MessageType, NodeId, SelectionMask,
    SensorReading, SensorReadings,
};
pub use wire::{Decode, DecodeError, Encode, Message};

// Re-export constants
pub use types::{
    BROADCAST_ADDR, IDLE_WAKE_INTERVAL, MAX_SENSORS_PER_NODE, PAIR_BROADCAST_INTERVAL,
    ROUND_POLL_INTERVAL,
};

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::traits::test_impls::{MemoryStore, MockClock, MockTransport};

    type TestCoordinator = CoordinatorNode<MockTransport, MemoryStore, MockClock, DefaultConfig>;
    type TestSensorNode<'a> = SensorNode<'a, MockTransport, MockClock>;

    const COORD: NodeId = [0xC0, 0, 0, 0, 0, 1];
    const SENSOR_A: NodeId = [0x24, 0x6F, 0x28, 0, 0, 0xA];
    const SENSOR_B: NodeId = [0x24, 0x6F, 0x28, 0, 0, 0xB];

    fn to_coordinator(coord: &mut TestCoordinator, sensor: &TestSensorNode<'_>, addr: NodeId, now: Timestamp) {
        for (_, frame) in sensor.transport().take_sent() {
            coord.handle_transport_rx(&addr, &frame, now);
        }
    }

    fn to_sensor(frames: &[(NodeId, Vec<u8>)], sensor: &mut TestSensorNode<'_>, addr: NodeId, now: Timestamp) {
        for (to, frame) in frames {
            if *to == addr {
                sensor.handle_transport_rx(&COORD, frame, now);
            }
        }
    }

    #[test]
    fn test_coordinator_creation() {
        let node: TestCoordinator =
            CoordinatorNode::new(MockTransport::new(), MemoryStore::new(), MockClock::new());
        assert_eq!(node.peer_count(), 0);
        assert_eq!(node.mode(), ModuleMode::Running);
        assert!(!node.is_round_active());
    }

    #[test]
    fn test_pair_and_collect_end_to_end() {
        let mut coord: TestCoordinator =
            CoordinatorNode::new(MockTransport::new(), MemoryStore::new(), MockClock::new());
        coord.set_mode(ModuleMode::Pairing);

        let flow_a: [SensorSampler; 1] = [SensorSampler::new(SensorConfig::DEFAULT)];
        let flow_b: [SensorSampler; 2] = [
            SensorSampler::new(SensorConfig::DEFAULT),
            SensorSampler::new(SensorConfig::DEFAULT),
        ];
        let mut a: TestSensorNode<'_> =
            SensorNode::new(MockTransport::new(), MockClock::new(), (), &flow_a).unwrap();
        let mut b: TestSensorNode<'_> =
            SensorNode::new(MockTransport::new(), MockClock::new(), (), &flow_b).unwrap();

        let t0 = Timestamp::ZERO;
        for (node, addr) in [(&mut a, SENSOR_A), (&mut b, SENSOR_B)] {
            node.start(t0);
            node.handle_timer(t0);
            to_coordinator(&mut coord, node, addr, t0);
            let confirms = coord.transport().take_sent();
            to_sensor(&confirms, node, addr, t0);
            assert_eq!(node.coordinator(), Some(COORD));
        }
        assert_eq!(
            coord.peer_infos().iter().map(|p| p.addr).collect::<Vec<_>>(),
            [SENSOR_A, SENSOR_B]
        );

        flow_b[1].register_pulse(Timestamp::from_millis(100));
        let now = Timestamp::from_millis(600);
        coord.clock().set(now);
        assert_eq!(coord.start_round(None), None);

        let requests = coord.transport().take_sent();
        to_sensor(&requests, &mut a, SENSOR_A, now);
        to_sensor(&requests, &mut b, SENSOR_B, now);
        // B answers first; results still merge in pairing order.
        to_coordinator(&mut coord, &b, SENSOR_B, now);
        assert!(coord.is_round_active());
        to_coordinator(&mut coord, &a, SENSOR_A, now);

        let merged = coord.last_round().unwrap();
        assert_eq!(merged.count(), 3);
        assert_eq!(merged.rates().collect::<Vec<_>>(), [0, 0, 24]);
        assert_eq!(merged.ages().collect::<Vec<_>>(), [0, 0, 500]);
    }
}
