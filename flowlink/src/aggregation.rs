//! Fan-out/fan-in collection rounds and configuration fan-out.
//!
//! A round is identified by its start time. It is complete once every peer's
//! last response is at or after that time, or immediately if there are no
//! peers. Until then [`poll`](AggregationCoordinator::poll) re-sends the data
//! request to the peers still missing, at [`ROUND_POLL_INTERVAL`].
//!
//! Completion merges the per-peer partial results in peer-index order, runs
//! every waiting callback once, and clears both. Callbacks are one-shot.
//!
//! There is no deadline here: a silent peer stalls the round until the caller
//! cancels it. [`CoordinatorNode::collect_round`](crate::node::CoordinatorNode::collect_round)
//! is the bounded wrapper.

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::collections::ShrinkingHashMap;
use crate::link::Link;
use crate::peers::PeerSet;
use crate::time::Timestamp;
use crate::traits::Transport;
use crate::types::{
    ConfigKind, MacAddr, MergedReadings, MessageType, NodeId, SelectionMask, SensorReadings,
    MAX_SENSORS_PER_NODE, ROUND_POLL_INTERVAL,
};
use crate::wire::{ConfigUpdate, Message};

/// One-shot completion callback.
pub type RoundCallback = Box<dyn FnOnce(&MergedReadings)>;

pub struct AggregationCoordinator {
    round_start: Option<Timestamp>,
    last_poll: Timestamp,
    last_response: ShrinkingHashMap<NodeId, Timestamp>,
    partials: ShrinkingHashMap<NodeId, SensorReadings>,
    callbacks: Vec<RoundCallback>,
}

impl AggregationCoordinator {
    pub fn new(max_peers: usize) -> Self {
        Self {
            round_start: None,
            last_poll: Timestamp::ZERO,
            last_response: ShrinkingHashMap::with_max_capacity(max_peers),
            partials: ShrinkingHashMap::with_max_capacity(max_peers),
            callbacks: Vec::new(),
        }
    }

    /// Start a round at `now`.
    ///
    /// Starting while a round is pending restarts it from `now`; callbacks
    /// from the earlier start stay queued and fire with the restarted round.
    /// With no peers the round completes before this returns and the empty
    /// result is returned as well as passed to the callbacks.
    pub fn start_round<T: Transport, H>(
        &mut self,
        link: &Link<T, H>,
        peers: &PeerSet,
        now: Timestamp,
        on_complete: Option<RoundCallback>,
    ) -> Option<MergedReadings> {
        if let Some(cb) = on_complete {
            self.callbacks.push(cb);
        }
        if self.round_start.is_some() {
            debug!("round restarted at {}ms", now.as_millis());
        }
        self.round_start = Some(now);

        if peers.is_empty() {
            return Some(self.finish(peers));
        }

        for addr in peers {
            link.send(addr, MessageType::DataRequest, &[]);
        }
        self.last_poll = now;
        None
    }

    /// Record a data response. Returns the merged result if this completed the round.
    pub fn handle_data_response(
        &mut self,
        peers: &PeerSet,
        from: &NodeId,
        readings: SensorReadings,
        now: Timestamp,
    ) -> Option<MergedReadings> {
        if !peers.contains(from) {
            debug!("data response from unpaired {}", MacAddr(*from));
            return None;
        }
        self.last_response.insert(*from, now);
        self.partials.insert(*from, readings);

        if self.round_start.is_none() {
            debug!("data response from {} outside a round", MacAddr(*from));
            return None;
        }
        if self.is_complete(peers) {
            return Some(self.finish(peers));
        }
        None
    }

    /// Drive the pending round at `now`.
    ///
    /// Re-sends the data request to every peer that has not answered since
    /// the round started, at most once per [`ROUND_POLL_INTERVAL`]. Also
    /// completes the round if the peer set changed underneath it.
    pub fn poll<T: Transport, H>(
        &mut self,
        link: &Link<T, H>,
        peers: &PeerSet,
        now: Timestamp,
    ) -> Option<MergedReadings> {
        let start = self.round_start?;
        if self.is_complete(peers) {
            return Some(self.finish(peers));
        }
        if now < self.last_poll + ROUND_POLL_INTERVAL {
            return None;
        }

        for addr in peers {
            if !self.responded_since(addr, start) {
                link.send(addr, MessageType::DataRequest, &[]);
            }
        }
        self.last_poll = now;
        None
    }

    /// Next time [`poll`](Self::poll) has work to do.
    pub fn next_poll(&self) -> Option<Timestamp> {
        self.round_start.map(|_| self.last_poll + ROUND_POLL_INTERVAL)
    }

    /// Whether every peer has answered since the pending round started.
    pub fn is_complete(&self, peers: &PeerSet) -> bool {
        match self.round_start {
            Some(start) => peers.iter().all(|addr| self.responded_since(addr, start)),
            None => false,
        }
    }

    /// Peers that have not answered the pending round.
    pub fn missing(&self, peers: &PeerSet) -> usize {
        match self.round_start {
            Some(start) => peers
                .iter()
                .filter(|addr| !self.responded_since(addr, start))
                .count(),
            None => 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.round_start.is_some()
    }

    pub fn round_start(&self) -> Option<Timestamp> {
        self.round_start
    }

    /// Last time `addr` answered, in this round or any earlier one.
    pub fn last_response(&self, addr: &NodeId) -> Option<Timestamp> {
        self.last_response.get(addr).copied()
    }

    /// Drop the pending round and its callbacks without firing them.
    pub fn cancel_round(&mut self) -> bool {
        if self.round_start.take().is_none() {
            return false;
        }
        self.callbacks.clear();
        self.partials.clear();
        info!("round cancelled");
        true
    }

    /// Forget a peer's response history after it was unpaired.
    pub fn forget(&mut self, addr: &NodeId) {
        self.last_response.remove(addr);
        self.partials.remove(addr);
    }

    fn responded_since(&self, addr: &NodeId, start: Timestamp) -> bool {
        self.last_response.get(addr).is_some_and(|t| *t >= start)
    }

    fn finish(&mut self, peers: &PeerSet) -> MergedReadings {
        let mut merged = MergedReadings::new();
        for addr in peers {
            if let Some(partial) = self.partials.get(addr) {
                merged.extend_from_slice(partial);
            }
        }

        self.round_start = None;
        for cb in self.callbacks.drain(..) {
            cb(&merged);
        }
        self.partials.clear();
        info!("round complete: {} peers, {} sensors", peers.len(), merged.count());
        merged
    }

    /// Send `value` for `kind` to every global sensor index in `indexes`.
    ///
    /// Global index `i` is local sensor `i % 9` on peer `i / 9`. Each peer
    /// with at least one selected sensor gets one message carrying the
    /// selection mask; peers with nothing selected get nothing. Indexes past
    /// the last peer are skipped. Returns the number of messages sent.
    pub fn set_config<T: Transport, H>(
        &self,
        link: &Link<T, H>,
        peers: &PeerSet,
        kind: ConfigKind,
        value: u16,
        indexes: &[usize],
    ) -> usize {
        let mut masks = alloc::vec![SelectionMask::EMPTY; peers.len()];
        for &index in indexes {
            let peer = index / MAX_SENSORS_PER_NODE;
            match masks.get_mut(peer) {
                Some(mask) => mask.set(index % MAX_SENSORS_PER_NODE),
                None => warn!("sensor index {} has no peer ({} paired)", index, peers.len()),
            }
        }

        let mut sent = 0;
        for (addr, mask) in peers.iter().zip(masks) {
            if mask.is_empty() {
                continue;
            }
            let msg = Message::SetConfig {
                kind,
                update: ConfigUpdate { value, mask },
            };
            link.send_message(addr, &msg);
            sent += 1;
        }
        sent
    }
}
