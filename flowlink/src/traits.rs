//! Platform seams: radio transport, time, key/value persistence and the
//! pairing indicator.
//!
//! These traits allow the protocol to be used with different:
//! - Transports (ESP-NOW, 802.15.4 raw frames, simulation)
//! - Time sources (hardware timer, embassy time driver, simulated time)
//! - Persistence backends (NVS, flash key/value stores, RAM)

use alloc::vec::Vec;
use core::fmt;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::time::Timestamp;
use crate::types::{Event, NodeId};

/// Queue size for inbound transport frames.
pub(crate) const TRANSPORT_QUEUE_SIZE: usize = 8;

/// Queue size for node commands.
pub(crate) const COMMAND_QUEUE_SIZE: usize = 8;

/// Queue size for event channel.
pub(crate) const EVENT_QUEUE_SIZE: usize = 16;

/// Mutex type used for channels and shared state.
pub(crate) type ChannelMutex = CriticalSectionRawMutex;

/// Raw datagram as delivered by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Sender's physical address.
    pub from: NodeId,
    /// Type byte followed by payload.
    pub data: Vec<u8>,
}

impl Incoming {
    pub fn new(from: NodeId, data: Vec<u8>) -> Self {
        Self { from, data }
    }
}

/// Inbound frame channel type.
pub type TransportInChannel = Channel<ChannelMutex, Incoming, TRANSPORT_QUEUE_SIZE>;

/// Protocol event channel.
pub type EventChannel = Channel<ChannelMutex, Event, EVENT_QUEUE_SIZE>;

/// Connectionless single-hop datagram radio.
///
/// Sends are fire-and-forget: `Ok` means the frame was handed to the radio,
/// not that anyone heard it. The receive path is interrupt driven: the radio
/// callback calls `incoming().try_send(..)` and the node drains the channel.
///
/// Addresses must be admitted with [`add_peer`](Transport::add_peer) before
/// frames are exchanged with them. Peer-table slots are scarce; admitting an
/// address that is already present may fail, so callers remove first.
pub trait Transport {
    type Error: fmt::Debug;

    /// Hand one frame to the radio.
    fn send(&self, to: &NodeId, frame: &[u8]) -> Result<(), Self::Error>;

    /// Admit `addr` to the radio's peer table.
    fn add_peer(&self, addr: &NodeId) -> Result<(), Self::Error>;

    /// Release `addr`'s peer-table slot.
    fn remove_peer(&self, addr: &NodeId) -> Result<(), Self::Error>;

    /// Channel for received frames.
    fn incoming(&self) -> &TransportInChannel;
}

/// Time source trait for real or simulated time.
///
/// # Example (embedded with embassy)
///
/// ```text
/// struct EmbassyClock;
///
/// impl Clock for EmbassyClock {
///     type SleepFuture<'a> = embassy_time::Timer;
///
///     fn now(&self) -> Timestamp {
///         Timestamp::from_millis(embassy_time::Instant::now().as_millis())
///     }
///
///     fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_> {
///         embassy_time::Timer::at(embassy_time::Instant::from_millis(time.as_millis()))
///     }
/// }
/// ```
pub trait Clock {
    /// Future type returned by sleep_until.
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    /// Get the current timestamp.
    fn now(&self) -> Timestamp;

    /// Sleep until the given timestamp.
    fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_>;
}

/// Key/value persistence with get/set/has-key semantics.
pub trait Store {
    type Error: fmt::Debug;

    fn has_key(&self, key: &str) -> bool;

    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error>;

    /// Read a little-endian `u32`. Missing or short values read as `None`.
    fn get_u32(&self, key: &str) -> Option<u32> {
        let bytes = self.get(key)?;
        let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), Self::Error> {
        self.set(key, &value.to_le_bytes())
    }
}

/// Visual indicator shown while a sensor node is looking for its coordinator.
pub trait Indicator {
    fn set_active(&mut self, active: bool);
}

/// Headless nodes.
impl Indicator for () {
    fn set_active(&mut self, _active: bool) {}
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and the simulator.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use alloc::collections::BTreeMap;
    use alloc::string::{String, ToString};
    use core::cell::{Cell, RefCell};
    use core::future::{ready, Ready};

    use super::*;
    use crate::time::Duration;

    /// Peer-table size of the mock radio, broadcast slot included.
    pub const MOCK_PEER_SLOTS: usize = 21;

    /// Errors reported by [`MockTransport`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockError {
        /// Destination not in the peer table.
        NotPeer,
        /// Address already in the peer table.
        Exists,
        /// Peer table is full.
        Full,
        /// Send failure injected by the test.
        Injected,
    }

    /// Mock radio recording every frame handed to it.
    pub struct MockTransport {
        sent: RefCell<Vec<(NodeId, Vec<u8>)>>,
        peers: RefCell<Vec<NodeId>>,
        fail_sends: Cell<bool>,
        incoming: TransportInChannel,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self {
                sent: RefCell::new(Vec::new()),
                peers: RefCell::new(Vec::new()),
                fail_sends: Cell::new(false),
                incoming: Channel::new(),
            }
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Inject a frame as if it was received.
        pub fn inject_rx(&self, from: NodeId, data: Vec<u8>) {
            let _ = self.incoming.try_send(Incoming::new(from, data));
        }

        /// Take all sent frames in send order.
        pub fn take_sent(&self) -> Vec<(NodeId, Vec<u8>)> {
            core::mem::take(&mut *self.sent.borrow_mut())
        }

        /// Frames sent to `to`, without draining.
        pub fn sent_to(&self, to: &NodeId) -> Vec<Vec<u8>> {
            self.sent
                .borrow()
                .iter()
                .filter(|(addr, _)| addr == to)
                .map(|(_, frame)| frame.clone())
                .collect()
        }

        /// Current peer table, in admission order.
        pub fn peers(&self) -> Vec<NodeId> {
            self.peers.borrow().clone()
        }

        pub fn is_peer(&self, addr: &NodeId) -> bool {
            self.peers.borrow().contains(addr)
        }

        /// Make every following send fail.
        pub fn set_fail_sends(&self, fail: bool) {
            self.fail_sends.set(fail);
        }
    }

    impl Transport for MockTransport {
        type Error = MockError;

        fn send(&self, to: &NodeId, frame: &[u8]) -> Result<(), MockError> {
            if self.fail_sends.get() {
                return Err(MockError::Injected);
            }
            if !self.is_peer(to) {
                return Err(MockError::NotPeer);
            }
            self.sent.borrow_mut().push((*to, frame.to_vec()));
            Ok(())
        }

        fn add_peer(&self, addr: &NodeId) -> Result<(), MockError> {
            let mut peers = self.peers.borrow_mut();
            if peers.contains(addr) {
                return Err(MockError::Exists);
            }
            if peers.len() >= MOCK_PEER_SLOTS {
                return Err(MockError::Full);
            }
            peers.push(*addr);
            Ok(())
        }

        fn remove_peer(&self, addr: &NodeId) -> Result<(), MockError> {
            let mut peers = self.peers.borrow_mut();
            let pos = peers.iter().position(|p| p == addr).ok_or(MockError::NotPeer)?;
            peers.remove(pos);
            Ok(())
        }

        fn incoming(&self) -> &TransportInChannel {
            &self.incoming
        }
    }

    /// Mock clock. Sleeping jumps straight to the wake-up time.
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self {
                current: Cell::new(Timestamp::ZERO),
            }
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
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

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Timestamp {
            self.current.get()
        }

        fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_> {
            if time > self.current.get() {
                self.current.set(time);
            }
            ready(())
        }
    }

    /// In-memory key/value store.
    #[derive(Default)]
    pub struct MemoryStore {
        entries: BTreeMap<String, Vec<u8>>,
        fail_writes: bool,
        writes: usize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every following write fail.
        pub fn set_fail_writes(&mut self, fail: bool) {
            self.fail_writes = fail;
        }

        /// Successful writes so far.
        pub fn writes(&self) -> usize {
            self.writes
        }
    }

    impl Store for MemoryStore {
        type Error = MockError;

        fn has_key(&self, key: &str) -> bool {
            self.entries.contains_key(key)
        }

        fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.entries.get(key).cloned()
        }

        fn set(&mut self, key: &str, value: &[u8]) -> Result<(), MockError> {
            if self.fail_writes {
                return Err(MockError::Injected);
            }
            self.entries.insert(key.to_string(), value.to_vec());
            self.writes += 1;
            Ok(())
        }
    }

    /// Indicator that remembers its state and how often it was switched.
    #[derive(Debug, Default)]
    pub struct MockIndicator {
        pub active: bool,
        pub switches: usize,
    }

    impl Indicator for MockIndicator {
        fn set_active(&mut self, active: bool) {
            if self.active != active {
                self.switches += 1;
            }
            self.active = active;
        }
    }
}
