//! Core types and constants for the flowlink protocol.

use core::fmt;

use heapless::Vec as BoundedVec;
use thiserror::Error;

use crate::time::Duration;
use crate::wire::DecodeError;

// Hardware limits
pub const MAX_SENSORS_PER_NODE: usize = 9; // width of the selection mask on the wire
pub const NODE_ID_LEN: usize = 6;

// Protocol constants
pub const RESPONSE_FLAG: u8 = 0x80;
pub const BROADCAST_ADDR: NodeId = [0xFF; NODE_ID_LEN];

// Timing constants
pub const PAIR_BROADCAST_INTERVAL: Duration = Duration::from_millis(500);
pub const ROUND_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const IDLE_WAKE_INTERVAL: Duration = Duration::from_secs(1);

// Persistence keys
pub const KEY_PEER_COUNT: &str = "peerCount";
pub const KEY_PEERS: &str = "peers";

/// 6-byte physical radio address.
pub type NodeId = [u8; NODE_ID_LEN];

/// Readings of one node, in local sensor order.
pub type SensorReadings = BoundedVec<SensorReading, MAX_SENSORS_PER_NODE>;

/// Leading byte of every frame.
///
/// A response type is its request type with [`RESPONSE_FLAG`] set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MessageType {
    PairRequest = 0x10,
    DataRequest = 0x11,
    SetWindow = 0x12,
    SetDebounce = 0x13,
    SetMinPulsesPerPacket = 0x14,
    SetMaxPackets = 0x15,
    PairConfirm = 0x10 | RESPONSE_FLAG,
    DataResponse = 0x11 | RESPONSE_FLAG,
}

impl MessageType {
    /// Parse a type byte. Unknown values yield `None` and the frame is dropped.
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x10 => MessageType::PairRequest,
            0x11 => MessageType::DataRequest,
            0x12 => MessageType::SetWindow,
            0x13 => MessageType::SetDebounce,
            0x14 => MessageType::SetMinPulsesPerPacket,
            0x15 => MessageType::SetMaxPackets,
            0x90 => MessageType::PairConfirm,
            0x91 => MessageType::DataResponse,
            _ => return None,
        })
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn is_response(self) -> bool {
        self.as_u8() & RESPONSE_FLAG != 0
    }

    /// Response type answering this request, if the request expects one.
    pub fn response(self) -> Option<Self> {
        if self.is_response() {
            return None;
        }
        Self::from_u8(self.as_u8() | RESPONSE_FLAG)
    }

    /// Configuration parameter carried by this type, if any.
    pub const fn config_kind(self) -> Option<ConfigKind> {
        match self {
            MessageType::SetWindow => Some(ConfigKind::Window),
            MessageType::SetDebounce => Some(ConfigKind::Debounce),
            MessageType::SetMinPulsesPerPacket => Some(ConfigKind::MinPulsesPerPacket),
            MessageType::SetMaxPackets => Some(ConfigKind::MaxPackets),
            _ => None,
        }
    }
}

/// Per-sensor parameter that can be set remotely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    /// Sliding window length in milliseconds.
    Window,
    /// Minimum spacing between two counted pulses in milliseconds.
    Debounce,
    /// Pulses needed before the estimator splits the window further.
    MinPulsesPerPacket,
    /// Upper bound on the number of packets the window is split into.
    MaxPackets,
}

impl ConfigKind {
    pub const ALL: [ConfigKind; 4] = [
        ConfigKind::Window,
        ConfigKind::Debounce,
        ConfigKind::MinPulsesPerPacket,
        ConfigKind::MaxPackets,
    ];

    pub const fn message_type(self) -> MessageType {
        match self {
            ConfigKind::Window => MessageType::SetWindow,
            ConfigKind::Debounce => MessageType::SetDebounce,
            ConfigKind::MinPulsesPerPacket => MessageType::SetMinPulsesPerPacket,
            ConfigKind::MaxPackets => MessageType::SetMaxPackets,
        }
    }
}

/// One sensor's contribution to a round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SensorReading {
    /// Smoothed pulses per minute.
    pub pulse_rate: u16,
    /// Milliseconds since the last counted pulse, 0 if none yet.
    pub last_pulse_age_ms: u32,
}

/// 9-bit set of local sensor indexes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SelectionMask(u16);

impl SelectionMask {
    pub const EMPTY: SelectionMask = SelectionMask(0);
    const VALID_BITS: u16 = (1 << MAX_SENSORS_PER_NODE) - 1;

    pub const fn all() -> Self {
        SelectionMask(Self::VALID_BITS)
    }

    pub const fn from_bits(bits: u16) -> Self {
        SelectionMask(bits & Self::VALID_BITS)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Flag `local` (ignored when out of range).
    pub fn set(&mut self, local: usize) {
        if local < MAX_SENSORS_PER_NODE {
            self.0 |= 1 << local;
        }
    }

    pub const fn contains(self, local: usize) -> bool {
        local < MAX_SENSORS_PER_NODE && self.0 & (1 << local) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Flagged local indexes in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_SENSORS_PER_NODE).filter(move |&i| self.contains(i))
    }
}

/// Combined result of a round: every peer's readings in peer-index order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergedReadings {
    readings: alloc::vec::Vec<SensorReading>,
}

impl MergedReadings {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn extend_from_slice(&mut self, readings: &[SensorReading]) {
        self.readings.extend_from_slice(readings);
    }

    /// Number of sensors across all peers.
    pub fn count(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn readings(&self) -> &[SensorReading] {
        &self.readings
    }

    pub fn rates(&self) -> impl Iterator<Item = u16> + '_ {
        self.readings.iter().map(|r| r.pulse_rate)
    }

    pub fn ages(&self) -> impl Iterator<Item = u32> + '_ {
        self.readings.iter().map(|r| r.last_pulse_age_ms)
    }
}

impl From<alloc::vec::Vec<SensorReading>> for MergedReadings {
    fn from(readings: alloc::vec::Vec<SensorReading>) -> Self {
        Self { readings }
    }
}

/// Display adapter printing a [`NodeId`] as `AA:BB:CC:DD:EE:FF`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub NodeId);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Events emitted by a node for application handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A new sensor node joined the peer set.
    PeerPaired { peer: NodeId, index: usize },
    /// A sensor node was unpaired.
    PeerRemoved { peer: NodeId },
    /// The coordinator's pairing window opened or closed.
    PairingWindowChanged { enabled: bool },
    /// A collection round finished, readings in peer-index order.
    RoundComplete { readings: MergedReadings },
    /// A sensor node bound to its coordinator.
    Bound { coordinator: NodeId },
}

/// Error type for node operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("{count} sensors exceed the per-node limit of {}", MAX_SENSORS_PER_NODE)]
    TooManySensors { count: usize },

    #[error("invalid sensor index entry at position {position}")]
    InvalidSensorIndex { position: usize },

    #[error("sensor index {index} out of range (limit {limit})")]
    SensorIndexOutOfRange { index: usize, limit: usize },

    #[error("round deadline exceeded with {missing} peers outstanding")]
    RoundTimeout { missing: usize },

    #[error("peer set full ({max} peers)")]
    PeerSetFull { max: usize },

    #[error("transport rejected peer {0}")]
    PeerRejected(MacAddr),

    #[error("handler table full for {0:?}")]
    HandlerTableFull(MessageType),

    #[error("persistence failed")]
    Persist,

    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
}
