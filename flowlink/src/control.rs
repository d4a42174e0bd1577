//! Shapes handed to the operator-facing control surface.
//!
//! The surface itself (HTTP, serial console, ...) lives outside this crate.
//! It reads and sets the operating mode, lists and removes peers, triggers
//! rounds and sends per-sensor parameters given as a comma-separated list of
//! global sensor indexes.

use alloc::vec::Vec;
use core::fmt;

use crate::peers::PeerSet;
use crate::types::{Error, MacAddr, NodeId};

/// Coordinator operating mode. `Pairing` is the open pairing window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModuleMode {
    #[default]
    Running,
    Pairing,
}

impl ModuleMode {
    pub const fn from_pairing(enabled: bool) -> Self {
        if enabled {
            ModuleMode::Pairing
        } else {
            ModuleMode::Running
        }
    }

    pub const fn is_pairing(self) -> bool {
        matches!(self, ModuleMode::Pairing)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ModuleMode::Running => "running",
            ModuleMode::Pairing => "pairing",
        }
    }

    /// Parse a mode name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("running") {
            Some(ModuleMode::Running)
        } else if name.eq_ignore_ascii_case("pairing") {
            Some(ModuleMode::Pairing)
        } else {
            None
        }
    }
}

impl fmt::Display for ModuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the peer listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub index: usize,
    pub addr: NodeId,
}

impl PeerInfo {
    /// Printable `AA:BB:CC:DD:EE:FF` form of the address.
    pub fn mac(&self) -> MacAddr {
        MacAddr(self.addr)
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.index, self.mac())
    }
}

/// Index-ordered listing of `peers`.
pub fn peer_infos(peers: &PeerSet) -> Vec<PeerInfo> {
    peers
        .iter()
        .enumerate()
        .map(|(index, addr)| PeerInfo { index, addr: *addr })
        .collect()
}

/// Parse `"0, 3,10"` into global sensor indexes.
///
/// Empty entries are skipped. Entries that are not decimal numbers, or are
/// `limit` or above, fail the whole list.
pub fn parse_sensor_indexes(list: &str, limit: usize) -> Result<Vec<usize>, Error> {
    let mut indexes = Vec::new();
    for (position, entry) in list.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let index: usize = entry
            .parse()
            .map_err(|_| Error::InvalidSensorIndex { position })?;
        if index >= limit {
            return Err(Error::SensorIndexOutOfRange { index, limit });
        }
        indexes.push(index);
    }
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;
    use alloc::vec;

    use super::*;

    #[test]
    fn test_parse_index_list() {
        assert_eq!(parse_sensor_indexes("0, 3,10", 18), Ok(vec![0, 3, 10]));
        assert_eq!(parse_sensor_indexes(" 4 ,, 5,", 18), Ok(vec![4, 5]));
        assert_eq!(parse_sensor_indexes("", 18), Ok(vec![]));
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert_eq!(
            parse_sensor_indexes("1,x,2", 18),
            Err(Error::InvalidSensorIndex { position: 1 })
        );
        assert_eq!(
            parse_sensor_indexes("-1", 18),
            Err(Error::InvalidSensorIndex { position: 0 })
        );
        assert_eq!(
            parse_sensor_indexes("2, 18", 18),
            Err(Error::SensorIndexOutOfRange { index: 18, limit: 18 })
        );
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(ModuleMode::from_name("Pairing"), Some(ModuleMode::Pairing));
        assert_eq!(ModuleMode::from_name(" running "), Some(ModuleMode::Running));
        assert_eq!(ModuleMode::from_name("idle"), None);
        assert_eq!(ModuleMode::from_pairing(true).to_string(), "pairing");
        assert!(!ModuleMode::default().is_pairing());
    }

    #[test]
    fn test_peer_listing() {
        let mut peers = PeerSet::new(4);
        peers.insert([0x24, 0x6F, 0x28, 0, 0, 1]).unwrap();
        peers.insert([0x24, 0x6F, 0x28, 0, 0, 2]).unwrap();
        let infos = peer_infos(&peers);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].index, 1);
        assert_eq!(infos[1].to_string(), "1: 24:6F:28:00:00:02");
    }
}
