//! Coordinator side of the pairing handshake.
//!
//! A single flag gates new pairings. Known peers are always confirmed, so a
//! sensor node that lost its binding (reboot, brown-out) can rejoin without
//! an operator reopening the window.

use log::{info, warn};

use crate::link::Link;
use crate::peers::{Insertion, PeerSet};
use crate::traits::{Store, Transport};
use crate::types::{MacAddr, NodeId};
use crate::wire::Message;

/// What a pair request led to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairOutcome {
    /// New peer added at `index` and confirmed.
    Paired { index: usize },
    /// Known peer confirmed again.
    Reconfirmed { index: usize },
    /// Pairing window closed; dropped without a reply.
    Ignored,
    /// Peer set full; dropped without a reply.
    Rejected,
}

pub struct PairingCoordinator {
    peers: PeerSet,
    enabled: bool,
}

impl PairingCoordinator {
    /// Start with the window closed.
    pub fn new(peers: PeerSet) -> Self {
        Self {
            peers,
            enabled: false,
        }
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Open or close the pairing window. Returns whether the state changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }
        self.enabled = enabled;
        info!("pairing window {}", if enabled { "open" } else { "closed" });
        true
    }

    /// Admit every known peer to the transport, e.g. after boot.
    pub fn restore<T: Transport, H>(&self, link: &Link<T, H>) {
        for addr in &self.peers {
            // Failures are logged by the link; the peer stays known.
            let _ = link.admit(addr);
        }
        if !self.peers.is_empty() {
            info!("restored {} peers", self.peers.len());
        }
    }

    pub fn handle_pair_request<T: Transport, H, S: Store>(
        &mut self,
        link: &Link<T, H>,
        store: &mut S,
        from: &NodeId,
    ) -> PairOutcome {
        if let Some(index) = self.peers.index_of(from) {
            confirm(link, from);
            return PairOutcome::Reconfirmed { index };
        }
        if !self.enabled {
            return PairOutcome::Ignored;
        }

        let index = match self.peers.insert(*from) {
            Ok(Insertion::Inserted(index)) | Ok(Insertion::AlreadyPresent(index)) => index,
            Err(e) => {
                warn!("pair request from {} dropped: {}", MacAddr(*from), e);
                return PairOutcome::Rejected;
            }
        };
        // Peer stays paired in memory even if the write fails.
        let _ = self.peers.persist(store);
        let _ = link.admit(from);
        confirm(link, from);

        info!("paired {} as peer {}", MacAddr(*from), index);
        PairOutcome::Paired { index }
    }

    /// Unpair `addr`. Returns the index it held.
    pub fn remove<T: Transport, H, S: Store>(
        &mut self,
        link: &Link<T, H>,
        store: &mut S,
        addr: &NodeId,
    ) -> Option<usize> {
        let index = self.peers.remove(addr)?;
        let _ = self.peers.persist(store);
        link.evict(addr);
        info!("removed peer {} (was {})", MacAddr(*addr), index);
        Some(index)
    }

    /// Unpair everyone. Returns the removed addresses in index order.
    pub fn remove_all<T: Transport, H, S: Store>(
        &mut self,
        link: &Link<T, H>,
        store: &mut S,
    ) -> alloc::vec::Vec<NodeId> {
        let removed = self.peers.as_slice().to_vec();
        for addr in &removed {
            link.evict(addr);
        }
        self.peers.clear();
        let _ = self.peers.persist(store);
        info!("removed all {} peers", removed.len());
        removed
    }
}

fn confirm<T: Transport, H>(link: &Link<T, H>, to: &NodeId) {
    link.send_message(to, &Message::PairConfirm { success: true });
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::traits::test_impls::{MemoryStore, MockTransport};
    use crate::types::KEY_PEER_COUNT;

    const A: NodeId = [0xAA, 1, 2, 3, 4, 5];
    const B: NodeId = [0xBB, 1, 2, 3, 4, 5];

    struct Fixture {
        link: Link<MockTransport, ()>,
        store: MemoryStore,
        pairing: PairingCoordinator,
    }

    fn fixture(max_peers: usize) -> Fixture {
        Fixture {
            link: Link::new(MockTransport::new(), 4),
            store: MemoryStore::new(),
            pairing: PairingCoordinator::new(PeerSet::new(max_peers)),
        }
    }

    impl Fixture {
        fn request(&mut self, from: &NodeId) -> PairOutcome {
            self.pairing
                .handle_pair_request(&self.link, &mut self.store, from)
        }
    }

    #[test]
    fn test_new_peer_paired_once() {
        let mut f = fixture(20);
        f.pairing.set_enabled(true);

        assert_eq!(f.request(&A), PairOutcome::Paired { index: 0 });
        assert_eq!(f.pairing.peers().len(), 1);
        assert_eq!(f.link.transport().take_sent(), vec![(A, vec![0x90, 1])]);
        assert!(f.link.transport().is_peer(&A));
        assert_eq!(f.store.get_u32(KEY_PEER_COUNT), Some(1));

        // Repeating is idempotent.
        assert_eq!(f.request(&A), PairOutcome::Reconfirmed { index: 0 });
        assert_eq!(f.pairing.peers().len(), 1);
        assert_eq!(f.link.transport().take_sent(), vec![(A, vec![0x90, 1])]);
    }

    #[test]
    fn test_closed_window_drops_unknown_silently() {
        let mut f = fixture(20);
        assert_eq!(f.request(&A), PairOutcome::Ignored);
        assert!(f.pairing.peers().is_empty());
        assert!(f.link.transport().take_sent().is_empty());
        assert_eq!(f.store.writes(), 0);
    }

    #[test]
    fn test_known_peer_confirmed_regardless_of_window() {
        let mut f = fixture(20);
        f.pairing.set_enabled(true);
        f.request(&A);
        f.pairing.set_enabled(false);
        f.link.transport().take_sent();

        assert_eq!(f.request(&A), PairOutcome::Reconfirmed { index: 0 });
        assert_eq!(f.link.transport().take_sent(), vec![(A, vec![0x90, 1])]);
    }

    #[test]
    fn test_full_peer_set_rejects() {
        let mut f = fixture(1);
        f.pairing.set_enabled(true);
        f.request(&A);
        f.link.transport().take_sent();
        assert_eq!(f.request(&B), PairOutcome::Rejected);
        assert!(f.link.transport().take_sent().is_empty());
    }

    #[test]
    fn test_persist_failure_still_pairs() {
        let mut f = fixture(20);
        f.pairing.set_enabled(true);
        f.store.set_fail_writes(true);
        assert_eq!(f.request(&A), PairOutcome::Paired { index: 0 });
        assert_eq!(f.link.transport().take_sent().len(), 1);
    }

    #[test]
    fn test_remove_reverses_admission_and_persistence() {
        let mut f = fixture(20);
        f.pairing.set_enabled(true);
        f.request(&A);
        f.request(&B);

        assert_eq!(f.pairing.remove(&f.link, &mut f.store, &A), Some(0));
        assert!(!f.link.transport().is_peer(&A));
        assert_eq!(PeerSet::load(&f.store, 20).as_slice(), &[B]);
        assert_eq!(f.pairing.remove(&f.link, &mut f.store, &A), None);

        assert_eq!(f.pairing.remove_all(&f.link, &mut f.store), vec![B]);
        assert!(f.link.transport().peers().is_empty());
        assert!(PeerSet::load(&f.store, 20).is_empty());
    }

    #[test]
    fn test_restore_admits_all() {
        let mut peers = PeerSet::new(20);
        peers.insert(A).unwrap();
        peers.insert(B).unwrap();
        let link: Link<MockTransport, ()> = Link::new(MockTransport::new(), 4);
        PairingCoordinator::new(peers).restore(&link);
        assert_eq!(link.transport().peers(), vec![A, B]);
    }

    #[test]
    fn test_set_enabled_reports_change() {
        let mut f = fixture(20);
        assert!(!f.pairing.set_enabled(false));
        assert!(f.pairing.set_enabled(true));
        assert!(!f.pairing.set_enabled(true));
        assert!(f.pairing.is_enabled());
    }
}
