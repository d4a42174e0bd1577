//! Sensor side of the pairing handshake.
//!
//! An unbound node broadcasts a pair request every
//! [`PAIR_BROADCAST_INTERVAL`] with its indicator lit, and binds to whichever
//! coordinator confirms first. There is no timeout or backoff: pairing is
//! operator supervised and the coordinator answers repeats idempotently.

use log::{debug, info};

use crate::link::Link;
use crate::time::Timestamp;
use crate::traits::{Indicator, Transport};
use crate::types::{MacAddr, NodeId, BROADCAST_ADDR, PAIR_BROADCAST_INTERVAL};
use crate::wire::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    Unbound,
    Bound(NodeId),
}

pub struct PairingClient<I> {
    binding: Binding,
    next_broadcast: Option<Timestamp>,
    indicator: I,
}

impl<I: Indicator> PairingClient<I> {
    pub fn new(indicator: I) -> Self {
        Self {
            binding: Binding::Unbound,
            next_broadcast: None,
            indicator,
        }
    }

    /// Begin searching: admit the broadcast address and light the indicator.
    ///
    /// The first request goes out on the next [`poll`](Self::poll).
    pub fn start<T: Transport, H>(&mut self, link: &Link<T, H>, now: Timestamp) {
        if self.is_bound() {
            return;
        }
        let _ = link.admit(&BROADCAST_ADDR);
        self.indicator.set_active(true);
        self.next_broadcast = Some(now);
        info!("searching for coordinator");
    }

    /// Send a pair request if one is due. Returns the next time this needs a poll.
    pub fn poll<T: Transport, H>(&mut self, link: &Link<T, H>, now: Timestamp) -> Option<Timestamp> {
        let due = self.next_broadcast?;
        if now >= due {
            link.send_message(&BROADCAST_ADDR, &Message::PairRequest);
            self.next_broadcast = Some(now + PAIR_BROADCAST_INTERVAL);
        }
        self.next_broadcast
    }

    /// Handle a confirm. Returns true if this bound the node.
    pub fn handle_pair_confirm<T: Transport, H>(
        &mut self,
        link: &Link<T, H>,
        from: &NodeId,
        success: bool,
    ) -> bool {
        if self.is_bound() {
            debug!("confirm from {} ignored, already bound", MacAddr(*from));
            return false;
        }
        if !success {
            debug!("negative confirm from {}", MacAddr(*from));
            return false;
        }

        link.evict(&BROADCAST_ADDR);
        let _ = link.admit(from);
        self.binding = Binding::Bound(*from);
        self.next_broadcast = None;
        self.indicator.set_active(false);
        info!("bound to coordinator {}", MacAddr(*from));
        true
    }

    /// When the next pair request is due, while searching.
    pub fn next_broadcast(&self) -> Option<Timestamp> {
        self.next_broadcast
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.binding, Binding::Bound(_))
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        match self.binding {
            Binding::Bound(addr) => Some(addr),
            Binding::Unbound => None,
        }
    }

    pub fn indicator(&self) -> &I {
        &self.indicator
    }
}
