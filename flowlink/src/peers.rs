//! Ordered, deduplicated, persisted set of paired sensor nodes.
//!
//! Insertion order is the peer index: aggregation merges results in this
//! order and global sensor index `i` lives on peer `i / 9`. Removing a peer
//! shifts every later peer down by one.
//!
//! Persisted as two keys: `peerCount` (u32 LE) and `peers` (count × 6 raw
//! address bytes). The two writes are not atomic; a crash between them is
//! caught on load by trusting the shorter of the two.

use alloc::vec::Vec;

use log::warn;

use crate::traits::Store;
use crate::types::{Error, NodeId, KEY_PEERS, KEY_PEER_COUNT, NODE_ID_LEN};

/// Outcome of [`PeerSet::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// New peer, now at this index.
    Inserted(usize),
    /// Already known at this index; nothing changed.
    AlreadyPresent(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSet {
    peers: Vec<NodeId>,
    max_peers: usize,
}

impl PeerSet {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: Vec::new(),
            max_peers,
        }
    }

    /// Restore from `store`. Missing keys give an empty set.
    ///
    /// Duplicate entries are dropped and anything past `max_peers` is ignored.
    pub fn load<S: Store>(store: &S, max_peers: usize) -> Self {
        let mut set = Self::new(max_peers);
        if !store.has_key(KEY_PEER_COUNT) {
            return set;
        }

        let declared = store.get_u32(KEY_PEER_COUNT).unwrap_or(0) as usize;
        let raw = store.get(KEY_PEERS).unwrap_or_default();
        let stored = raw.len() / NODE_ID_LEN;
        if declared != stored {
            warn!("peer store mismatch: count {} but {} addresses", declared, stored);
        }

        for chunk in raw.chunks_exact(NODE_ID_LEN).take(declared) {
            let mut addr = [0u8; NODE_ID_LEN];
            addr.copy_from_slice(chunk);
            if let Err(e) = set.insert(addr) {
                warn!("peer store truncated: {}", e);
                break;
            }
        }
        set
    }

    /// Write the whole set to `store`.
    pub fn persist<S: Store>(&self, store: &mut S) -> Result<(), Error> {
        let mut raw = Vec::with_capacity(self.peers.len() * NODE_ID_LEN);
        for addr in &self.peers {
            raw.extend_from_slice(addr);
        }
        store.set_u32(KEY_PEER_COUNT, self.peers.len() as u32).map_err(|e| {
            warn!("persist peer count: {:?}", e);
            Error::Persist
        })?;
        store.set(KEY_PEERS, &raw).map_err(|e| {
            warn!("persist peers: {:?}", e);
            Error::Persist
        })
    }

    /// Append `addr` unless already present.
    pub fn insert(&mut self, addr: NodeId) -> Result<Insertion, Error> {
        if let Some(index) = self.index_of(&addr) {
            return Ok(Insertion::AlreadyPresent(index));
        }
        if self.peers.len() >= self.max_peers {
            return Err(Error::PeerSetFull {
                max: self.max_peers,
            });
        }
        self.peers.push(addr);
        Ok(Insertion::Inserted(self.peers.len() - 1))
    }

    /// Remove `addr`, returning the index it held.
    pub fn remove(&mut self, addr: &NodeId) -> Option<usize> {
        let index = self.index_of(addr)?;
        self.peers.remove(index);
        Some(index)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn contains(&self, addr: &NodeId) -> bool {
        self.peers.contains(addr)
    }

    pub fn index_of(&self, addr: &NodeId) -> Option<usize> {
        self.peers.iter().position(|p| p == addr)
    }

    pub fn get(&self, index: usize) -> Option<&NodeId> {
        self.peers.get(index)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn iter(&self) -> core::slice::Iter<'_, NodeId> {
        self.peers.iter()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.peers
    }
}

impl<'a> IntoIterator for &'a PeerSet {
    type Item = &'a NodeId;
    type IntoIter = core::slice::Iter<'a, NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::traits::test_impls::MemoryStore;

    fn addr(n: u8) -> NodeId {
        [0x24, 0x6F, 0x28, 0, 0, n]
    }

    #[test]
    fn test_insert_dedups_and_keeps_order() {
        let mut set = PeerSet::new(20);
        assert_eq!(set.insert(addr(3)), Ok(Insertion::Inserted(0)));
        assert_eq!(set.insert(addr(1)), Ok(Insertion::Inserted(1)));
        assert_eq!(set.insert(addr(3)), Ok(Insertion::AlreadyPresent(0)));
        assert_eq!(set.as_slice(), &[addr(3), addr(1)]);
    }

    #[test]
    fn test_full_set_rejects_new_but_not_known() {
        let mut set = PeerSet::new(2);
        set.insert(addr(1)).unwrap();
        set.insert(addr(2)).unwrap();
        assert_eq!(set.insert(addr(3)), Err(Error::PeerSetFull { max: 2 }));
        assert_eq!(set.insert(addr(2)), Ok(Insertion::AlreadyPresent(1)));
    }

    #[test]
    fn test_remove_shifts_indexes() {
        let mut set = PeerSet::new(20);
        for n in 1..=3 {
            set.insert(addr(n)).unwrap();
        }
        assert_eq!(set.remove(&addr(1)), Some(0));
        assert_eq!(set.remove(&addr(1)), None);
        assert_eq!(set.index_of(&addr(3)), Some(1));
    }

    #[test]
    fn test_persist_layout() {
        let mut set = PeerSet::new(20);
        set.insert(addr(7)).unwrap();
        set.insert(addr(9)).unwrap();
        let mut store = MemoryStore::new();
        set.persist(&mut store).unwrap();

        assert_eq!(store.get_u32(KEY_PEER_COUNT), Some(2));
        assert_eq!(
            store.get(KEY_PEERS),
            Some(vec![0x24, 0x6F, 0x28, 0, 0, 7, 0x24, 0x6F, 0x28, 0, 0, 9])
        );
        assert_eq!(PeerSet::load(&store, 20), set);
    }

    #[test]
    fn test_load_missing_keys() {
        let store = MemoryStore::new();
        assert!(PeerSet::load(&store, 20).is_empty());
    }

    #[test]
    fn test_load_tolerates_torn_write() {
        let mut store = MemoryStore::new();
        // Count was written, address bytes still hold the previous, shorter list.
        store.set_u32(KEY_PEER_COUNT, 3).unwrap();
        let mut raw = addr(1).to_vec();
        raw.extend_from_slice(&addr(2));
        raw.extend_from_slice(&addr(1));
        raw.push(0xEE);
        store.set(KEY_PEERS, &raw).unwrap();

        let set = PeerSet::load(&store, 20);
        assert_eq!(set.as_slice(), &[addr(1), addr(2)]);
    }

    #[test]
    fn test_load_respects_capacity() {
        let mut big = PeerSet::new(20);
        for n in 0..5 {
            big.insert(addr(n)).unwrap();
        }
        let mut store = MemoryStore::new();
        big.persist(&mut store).unwrap();
        assert_eq!(PeerSet::load(&store, 3).len(), 3);
    }

    #[test]
    fn test_persist_failure() {
        let mut store = MemoryStore::new();
        store.set_fail_writes(true);
        assert_eq!(PeerSet::new(4).persist(&mut store), Err(Error::Persist));
    }
}
