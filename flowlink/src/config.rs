//! Compile-time capacities and runtime sensor parameters.
//!
//! The `NetworkConfig` trait bounds every collection a node owns. Use
//! `DefaultConfig` on ESP32-class parts, `SmallConfig` on tighter MCUs.
//!
//! # Example
//!
//! ```ignore
//! use flowlink::{CoordinatorNode, DefaultConfig, SmallConfig};
//!
//! let node = CoordinatorNode::<_, _, _, DefaultConfig>::new(transport, store, clock);
//!
//! // Custom bounds
//! struct MyConfig;
//! impl NetworkConfig for MyConfig {
//!     const MAX_PEERS: usize = 6;
//!     // ... other constants
//! }
//! ```

use crate::time::Duration;
use crate::types::ConfigKind;

/// Configuration trait for compile-time memory tuning.
///
/// All bounds must be non-zero.
pub trait NetworkConfig {
    /// Maximum paired sensor nodes. Matches the radio's peer-table size.
    const MAX_PEERS: usize;

    /// Maximum pulse timestamps retained per sensor. When full, the oldest is dropped.
    ///
    /// Samplers are fixed storage sized by a const parameter, so this is
    /// applied at the sampler's type: `SensorSampler<{ C::MAX_PULSES_PER_SENSOR }>`
    /// for a concrete `C`.
    const MAX_PULSES_PER_SENSOR: usize;

    /// Maximum handlers registered for a single message type.
    const MAX_HANDLERS_PER_TYPE: usize;
}

/// Default configuration.
///
/// 20 peers is the ESP-NOW unencrypted peer limit. 512 pulses covers a
/// 2.5 s window at 200 Hz.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl NetworkConfig for DefaultConfig {
    const MAX_PEERS: usize = 20;
    const MAX_PULSES_PER_SENSOR: usize = 512;
    const MAX_HANDLERS_PER_TYPE: usize = 4;
}

/// Pulse-log capacity of a [`SensorSampler`](crate::SensorSampler) unless sized otherwise.
pub const DEFAULT_MAX_PULSES: usize = DefaultConfig::MAX_PULSES_PER_SENSOR;

/// Small configuration for constrained devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl NetworkConfig for SmallConfig {
    const MAX_PEERS: usize = 6;
    const MAX_PULSES_PER_SENSOR: usize = 128;
    const MAX_HANDLERS_PER_TYPE: usize = 2;
}

/// Runtime parameters of one sensor's rate estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorConfig {
    /// Length of the sliding window.
    pub window: Duration,
    /// Pulses closer together than this are contact bounce.
    pub debounce: Duration,
    /// Pulses per packet before the window is split further.
    pub min_pulses_per_packet: u32,
    /// Upper bound on packets per window.
    pub max_packets: u32,
}

impl SensorConfig {
    pub const DEFAULT_WINDOW_MS: u64 = 2500;
    pub const DEFAULT_DEBOUNCE_MS: u64 = 5;
    pub const DEFAULT_MIN_PULSES_PER_PACKET: u32 = 3;
    pub const DEFAULT_MAX_PACKETS: u32 = 5;

    pub const DEFAULT: SensorConfig = SensorConfig {
        window: Duration::from_millis(Self::DEFAULT_WINDOW_MS),
        debounce: Duration::from_millis(Self::DEFAULT_DEBOUNCE_MS),
        min_pulses_per_packet: Self::DEFAULT_MIN_PULSES_PER_PACKET,
        max_packets: Self::DEFAULT_MAX_PACKETS,
    };

    /// Apply a remotely-set value.
    ///
    /// Window, packet size and packet count are divisors in the estimator,
    /// so zero is raised to 1. A zero debounce disables debouncing.
    pub fn apply(&mut self, kind: ConfigKind, value: u16) {
        let clamped = u32::from(value).max(1);
        match kind {
            ConfigKind::Window => self.window = Duration::from_millis(u64::from(clamped)),
            ConfigKind::Debounce => self.debounce = Duration::from_millis(u64::from(value)),
            ConfigKind::MinPulsesPerPacket => self.min_pulses_per_packet = clamped,
            ConfigKind::MaxPackets => self.max_packets = clamped,
        }
    }

    /// Window length in milliseconds, never zero.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis().max(1)
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
