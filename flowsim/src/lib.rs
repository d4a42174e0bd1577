//! flowsim - Discrete event simulator for flowlink coordinator/sensor networks.
//!
//! This crate provides a deterministic, discrete-event simulator for testing
//! pairing, collection rounds and configuration fan-out without real radios
//! or real-time delays.
//!
//! # Features
//!
//! - **Discrete event simulation**: No real-time delays, deterministic ordering
//! - **Whole network in one process**: One coordinator plus any number of sensor nodes
//! - **Configurable topology**: Star, fully connected, or custom
//! - **Link properties**: Packet loss, delay, enable/disable per link
//! - **Scheduled pulses**: Pulse trains per flow sensor drive the rate estimators
//! - **Scenario builder**: Commands, partitions, healing and loss changes on a timeline
//! - **Metrics collection**: Message counts, pairing snapshots, completed rounds
//!
//! # Example
//!
//! ```
//! use flowsim::{Duration, ScenarioBuilder, Timestamp};
//!
//! // Three sensor nodes pair, then one round is collected
//! let result = ScenarioBuilder::new(3)
//!     .round_at(Timestamp::from_secs(1))
//!     .run_for(Duration::from_secs(2));
//!
//! assert!(result.all_paired());
//! assert_eq!(result.rounds_completed(), 1);
//! ```
//!
//! # Architecture
//!
//! The simulator uses a priority queue of events ordered by (time, sequence_number).
//! The main loop:
//! 1. Pop next event from queue
//! 2. Advance simulation time
//! 3. Process event (call node handlers)
//! 4. Collect outgoing frames and published events
//! 5. Route frames through topology, schedule deliveries, re-arm the node's timer
//!
//! Handlers are called directly (`handle_transport_rx`, `handle_timer`,
//! `handle_command`) instead of through the async `run()` loops.

pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

// Re-export main types
pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use flowlink::{Duration, NodeId, Timestamp};
pub use metrics::{NetworkSnapshot, NodeEvent, RoundRecord, SimMetrics, SimulationResult};
pub use node::{SimClock, SimNode, SimTransport};
pub use scenario::{
    lossy_scenario, sensor_node_id, simple_scenario, ScenarioBuilder, COORDINATOR_ID,
};
pub use sim::Simulator;
pub use topology::{Link, Topology};
