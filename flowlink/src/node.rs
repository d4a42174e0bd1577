//! Node roles: one explicit instance per role wiring the protocol pieces.
//!
//! Each node is fully event-driven:
//! - Incoming transport frames are dispatched by message type
//! - Commands from the application arrive on a channel (coordinator only)
//! - Timers drive pairing broadcasts and round retries
//!
//! The synchronous `handle_*` methods are the whole state machine; `run()`
//! only waits on the sources above and feeds them in. The simulator calls the
//! handlers directly.
//!
//! # Usage
//!
//! ```ignore
//! let mut node = CoordinatorNode::<_, _, _>::new(transport, store, clock);
//!
//! // Spawn the node's run loop
//! spawn(async move {
//!     node.run().await;
//! });
//!
//! // Open the pairing window and collect a round
//! node.commands().send(Command::SetMode(ModuleMode::Pairing)).await;
//! node.commands().send(Command::StartRound).await;
//!
//! // Results arrive as events
//! if let Event::RoundComplete { readings } = node.events().receive().await {
//!     // ...
//! }
//! ```

use alloc::vec::Vec;
use core::marker::PhantomData;

use embassy_sync::channel::Channel;
use log::{debug, warn};

use crate::aggregation::{AggregationCoordinator, RoundCallback};
use crate::client::PairingClient;
use crate::config::{DefaultConfig, NetworkConfig, DEFAULT_MAX_PULSES};
use crate::control::{self, ModuleMode, PeerInfo};
use crate::link::{Link, LinkMetrics};
use crate::pairing::{PairOutcome, PairingCoordinator};
use crate::peers::PeerSet;
use crate::responder::SecondaryResponder;
use crate::sampler::SensorSampler;
use crate::time::{Duration, Timestamp};
use crate::traits::{
    ChannelMutex, Clock, EventChannel, Indicator, Store, Transport, COMMAND_QUEUE_SIZE,
};
use crate::types::{
    ConfigKind, Error, Event, MacAddr, MergedReadings, MessageType, NodeId, IDLE_WAKE_INTERVAL,
    MAX_SENSORS_PER_NODE,
};
use crate::wire::Message;

/// Application requests to a running coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    StartRound,
    CancelRound,
    SetMode(ModuleMode),
    SetConfig {
        kind: ConfigKind,
        value: u16,
        indexes: Vec<usize>,
    },
    RemovePeer(NodeId),
    RemoveAllPeers,
}

/// Coordinator command channel.
pub type CommandChannel = Channel<ChannelMutex, Command, COMMAND_QUEUE_SIZE>;

/// Handler tokens registered on the coordinator's link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorRoute {
    Pairing,
    Aggregation,
}

/// Handler tokens registered on a sensor node's link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorRoute {
    Pairing,
    Data,
    Config,
}

fn push_event(events: &EventChannel, event: Event) {
    if events.try_send(event).is_err() {
        debug!("event channel full, event dropped");
    }
}

/// The hub node: pairs sensor nodes, runs collection rounds and fans out
/// configuration.
///
/// Generic over:
/// - `T`: Transport implementation
/// - `S`: Persistent key/value store for the peer set
/// - `Clk`: Clock/timer implementation
/// - `C`: Compile-time capacities
pub struct CoordinatorNode<T, S, Clk, C = DefaultConfig> {
    link: Link<T, CoordinatorRoute>,
    store: S,
    clock: Clk,

    pairing: PairingCoordinator,
    aggregation: AggregationCoordinator,

    commands: CommandChannel,
    events: EventChannel,

    last_round: Option<MergedReadings>,
    _config: PhantomData<C>,
}

impl<T, S, Clk, C> CoordinatorNode<T, S, Clk, C>
where
    T: Transport,
    S: Store,
    Clk: Clock,
    C: NetworkConfig,
{
    /// Load the persisted peer set and re-admit every peer to the transport.
    ///
    /// Starts in [`ModuleMode::Running`] with the pairing window closed.
    pub fn new(transport: T, store: S, clock: Clk) -> Self {
        let mut link = Link::new(transport, C::MAX_HANDLERS_PER_TYPE);
        for (kind, route) in [
            (MessageType::PairRequest, CoordinatorRoute::Pairing),
            (MessageType::DataResponse, CoordinatorRoute::Aggregation),
        ] {
            if let Err(e) = link.register_handler(kind, route) {
                warn!("{}", e);
            }
        }

        let peers = PeerSet::load(&store, C::MAX_PEERS);
        let pairing = PairingCoordinator::new(peers);
        pairing.restore(&link);

        Self {
            link,
            store,
            clock,
            pairing,
            aggregation: AggregationCoordinator::new(C::MAX_PEERS),
            commands: Channel::new(),
            events: Channel::new(),
            last_round: None,
            _config: PhantomData,
        }
    }

    /// Run the node's main loop.
    ///
    /// Waits on inbound frames, commands and the next timer deadline.
    pub async fn run(&mut self) -> ! {
        use embassy_futures::select::{select3, Either3};

        loop {
            let wake = self.next_wake(self.clock.now());
            let result = select3(
                self.link.transport().incoming().receive(),
                self.commands.receive(),
                self.clock.sleep_until(wake),
            )
            .await;

            let now = self.clock.now();
            match result {
                Either3::First(msg) => {
                    self.handle_transport_rx(&msg.from, &msg.data, now);
                }
                Either3::Second(cmd) => self.handle_command(cmd, now),
                Either3::Third(()) => {
                    self.handle_timer(now);
                }
            }
        }
    }

    /// Start a round and wait for it, giving up after `timeout`.
    ///
    /// On expiry the round is cancelled and the error reports how many
    /// peers had not answered.
    pub async fn collect_round(&mut self, timeout: Duration) -> Result<MergedReadings, Error> {
        use embassy_futures::select::{select, Either};

        let deadline = self.clock.now() + timeout;
        if let Some(merged) = self.start_round(None) {
            return Ok(merged);
        }

        loop {
            let now = self.clock.now();
            if now >= deadline {
                let missing = self.aggregation.missing(self.pairing.peers());
                self.aggregation.cancel_round();
                warn!("round timed out, {} peers silent", missing);
                return Err(Error::RoundTimeout { missing });
            }

            let wake = self.next_wake(now).min(deadline);
            let result = select(
                self.link.transport().incoming().receive(),
                self.clock.sleep_until(wake),
            )
            .await;

            let now = self.clock.now();
            let completed = match result {
                Either::First(msg) => self.handle_transport_rx(&msg.from, &msg.data, now),
                Either::Second(()) => self.handle_timer(now),
            };
            if let Some(merged) = completed {
                return Ok(merged);
            }
        }
    }

    /// When the node next has timer work.
    pub fn next_wake(&self, now: Timestamp) -> Timestamp {
        self.aggregation
            .next_poll()
            .unwrap_or(now + IDLE_WAKE_INTERVAL)
    }

    /// Handle one inbound datagram. Returns the merged result if it completed a round.
    pub fn handle_transport_rx(
        &mut self,
        from: &NodeId,
        data: &[u8],
        now: Timestamp,
    ) -> Option<MergedReadings> {
        let Self {
            link,
            store,
            pairing,
            aggregation,
            events,
            ..
        } = self;
        let link = &*link;

        let mut completed = None;
        link.dispatch(from, data, |route, inbound| match route {
            CoordinatorRoute::Pairing => {
                if let PairOutcome::Paired { index } =
                    pairing.handle_pair_request(link, store, &inbound.from)
                {
                    push_event(
                        events,
                        Event::PeerPaired {
                            peer: inbound.from,
                            index,
                        },
                    );
                }
            }
            CoordinatorRoute::Aggregation => match inbound.message() {
                Ok(Message::DataResponse(readings)) => {
                    completed = aggregation.handle_data_response(
                        pairing.peers(),
                        &inbound.from,
                        readings,
                        now,
                    );
                }
                Ok(_) => {}
                Err(e) => link.note_malformed(&inbound, e),
            },
        });

        if let Some(merged) = &completed {
            self.round_complete(merged);
        }
        completed
    }

    /// Drive retries of the pending round. Returns the merged result if it completed.
    pub fn handle_timer(&mut self, now: Timestamp) -> Option<MergedReadings> {
        let merged = self.aggregation.poll(&self.link, self.pairing.peers(), now)?;
        self.round_complete(&merged);
        Some(merged)
    }

    pub fn handle_command(&mut self, cmd: Command, now: Timestamp) {
        debug!("command {:?}", cmd);
        match cmd {
            Command::StartRound => {
                self.begin_round(now, None);
            }
            Command::CancelRound => {
                self.cancel_round();
            }
            Command::SetMode(mode) => self.set_mode(mode),
            Command::SetConfig {
                kind,
                value,
                indexes,
            } => {
                self.set_config(kind, value, &indexes);
            }
            Command::RemovePeer(addr) => {
                self.remove_peer(&addr);
            }
            Command::RemoveAllPeers => {
                self.remove_all_peers();
            }
        }
    }

    /// Ask every peer for its readings.
    ///
    /// With no peers the round completes immediately and the empty result is
    /// returned. Otherwise the result arrives through `on_complete`, the
    /// [`Event::RoundComplete`] event and [`last_round`](Self::last_round).
    pub fn start_round(&mut self, on_complete: Option<RoundCallback>) -> Option<MergedReadings> {
        let now = self.clock.now();
        self.begin_round(now, on_complete)
    }

    fn begin_round(
        &mut self,
        now: Timestamp,
        on_complete: Option<RoundCallback>,
    ) -> Option<MergedReadings> {
        let merged =
            self.aggregation
                .start_round(&self.link, self.pairing.peers(), now, on_complete)?;
        self.round_complete(&merged);
        Some(merged)
    }

    fn round_complete(&mut self, merged: &MergedReadings) {
        self.last_round = Some(merged.clone());
        push_event(
            &self.events,
            Event::RoundComplete {
                readings: merged.clone(),
            },
        );
    }

    /// Drop the pending round without running its callbacks.
    pub fn cancel_round(&mut self) -> bool {
        self.aggregation.cancel_round()
    }

    pub fn is_round_active(&self) -> bool {
        self.aggregation.is_active()
    }

    /// Result of the most recent completed round.
    pub fn last_round(&self) -> Option<&MergedReadings> {
        self.last_round.as_ref()
    }

    /// Send a parameter to the given global sensor indexes. Returns messages sent.
    pub fn set_config(&self, kind: ConfigKind, value: u16, indexes: &[usize]) -> usize {
        self.aggregation
            .set_config(&self.link, self.pairing.peers(), kind, value, indexes)
    }

    /// [`set_config`](Self::set_config) with indexes given as `"0, 3,10"`.
    ///
    /// Indexes must address a sensor slot of a paired peer.
    pub fn set_config_list(&self, kind: ConfigKind, value: u16, list: &str) -> Result<usize, Error> {
        let limit = self.pairing.peers().len() * MAX_SENSORS_PER_NODE;
        let indexes = control::parse_sensor_indexes(list, limit)?;
        Ok(self.set_config(kind, value, &indexes))
    }

    pub fn mode(&self) -> ModuleMode {
        ModuleMode::from_pairing(self.pairing.is_enabled())
    }

    /// Switch mode. Entering [`ModuleMode::Pairing`] opens the pairing window.
    pub fn set_mode(&mut self, mode: ModuleMode) {
        if self.pairing.set_enabled(mode.is_pairing()) {
            push_event(
                &self.events,
                Event::PairingWindowChanged {
                    enabled: mode.is_pairing(),
                },
            );
        }
    }

    pub fn peers(&self) -> &PeerSet {
        self.pairing.peers()
    }

    pub fn peer_count(&self) -> usize {
        self.pairing.peers().len()
    }

    /// Index-ordered peers with printable addresses.
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        control::peer_infos(self.pairing.peers())
    }

    /// Unpair one peer. Later peers move down one index.
    pub fn remove_peer(&mut self, addr: &NodeId) -> Option<usize> {
        let index = self.pairing.remove(&self.link, &mut self.store, addr)?;
        self.aggregation.forget(addr);
        push_event(&self.events, Event::PeerRemoved { peer: *addr });
        Some(index)
    }

    /// Unpair every peer. Returns how many were removed.
    pub fn remove_all_peers(&mut self) -> usize {
        let removed = self.pairing.remove_all(&self.link, &mut self.store);
        for addr in &removed {
            self.aggregation.forget(addr);
            push_event(&self.events, Event::PeerRemoved { peer: *addr });
        }
        removed.len()
    }

    /// Channel for application commands.
    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    /// Channel for protocol events.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn transport(&self) -> &T {
        self.link.transport()
    }

    pub fn metrics(&self) -> &LinkMetrics {
        self.link.metrics()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

/// A node reporting up to nine local flow sensors to its coordinator.
///
/// Samplers are borrowed so they can also be reached from the pulse
/// interrupt. Until bound, the node broadcasts pair requests; afterwards it
/// answers only its coordinator.
pub struct SensorNode<'a, T, Clk, I = (), C = DefaultConfig, const P: usize = DEFAULT_MAX_PULSES> {
    link: Link<T, SensorRoute>,
    clock: Clk,
    client: PairingClient<I>,
    responder: SecondaryResponder<'a, P>,
    events: EventChannel,
    _config: PhantomData<C>,
}

impl<'a, T, Clk, I, C, const P: usize> SensorNode<'a, T, Clk, I, C, P>
where
    T: Transport,
    Clk: Clock,
    I: Indicator,
    C: NetworkConfig,
{
    /// Fails if more than nine samplers are given.
    pub fn new(
        transport: T,
        clock: Clk,
        indicator: I,
        sensors: &'a [SensorSampler<P>],
    ) -> Result<Self, Error> {
        let responder = SecondaryResponder::new(sensors)?;

        let mut link = Link::new(transport, C::MAX_HANDLERS_PER_TYPE);
        link.register_handler(MessageType::PairConfirm, SensorRoute::Pairing)?;
        link.register_handler(MessageType::DataRequest, SensorRoute::Data)?;
        for kind in ConfigKind::ALL {
            link.register_handler(kind.message_type(), SensorRoute::Config)?;
        }

        Ok(Self {
            link,
            clock,
            client: PairingClient::new(indicator),
            responder,
            events: Channel::new(),
            _config: PhantomData,
        })
    }

    /// Start looking for a coordinator.
    pub fn start(&mut self, now: Timestamp) {
        self.client.start(&self.link, now);
    }

    /// Run the node's main loop. Pairing starts immediately.
    pub async fn run(&mut self) -> ! {
        use embassy_futures::select::{select, Either};

        let now = self.clock.now();
        self.start(now);

        loop {
            let wake = self.next_wake(self.clock.now());
            let result = select(
                self.link.transport().incoming().receive(),
                self.clock.sleep_until(wake),
            )
            .await;

            let now = self.clock.now();
            match result {
                Either::First(msg) => self.handle_transport_rx(&msg.from, &msg.data, now),
                Either::Second(()) => self.handle_timer(now),
            }
        }
    }

    /// When the node next has timer work.
    pub fn next_wake(&self, now: Timestamp) -> Timestamp {
        self.client
            .next_broadcast()
            .unwrap_or(now + IDLE_WAKE_INTERVAL)
    }

    pub fn handle_timer(&mut self, now: Timestamp) {
        self.client.poll(&self.link, now);
    }

    pub fn handle_transport_rx(&mut self, from: &NodeId, data: &[u8], now: Timestamp) {
        let Self {
            link,
            client,
            responder,
            events,
            ..
        } = self;
        let link = &*link;

        link.dispatch(from, data, |route, inbound| {
            let msg = match inbound.message() {
                Ok(msg) => msg,
                Err(e) => {
                    link.note_malformed(&inbound, e);
                    return;
                }
            };
            let from_coordinator = client.coordinator() == Some(inbound.from);

            match (route, msg) {
                (SensorRoute::Pairing, Message::PairConfirm { success }) => {
                    if client.handle_pair_confirm(link, &inbound.from, success) {
                        push_event(
                            events,
                            Event::Bound {
                                coordinator: inbound.from,
                            },
                        );
                    }
                }
                (SensorRoute::Data, Message::DataRequest) if from_coordinator => {
                    responder.handle_data_request(link, &inbound.from, now);
                }
                (SensorRoute::Config, Message::SetConfig { kind, update }) if from_coordinator => {
                    responder.handle_set_config(kind, update);
                }
                (_, msg) => {
                    debug!(
                        "ignoring {:?} from {}",
                        msg.message_type(),
                        MacAddr(inbound.from)
                    );
                }
            }
        });
    }

    pub fn is_bound(&self) -> bool {
        self.client.is_bound()
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.client.coordinator()
    }

    pub fn indicator(&self) -> &I {
        self.client.indicator()
    }

    pub fn sensors(&self) -> &'a [SensorSampler<P>] {
        self.responder.sensors()
    }

    /// Channel for protocol events.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn transport(&self) -> &T {
        self.link.transport()
    }

    pub fn metrics(&self) -> &LinkMetrics {
        self.link.metrics()
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }
}
