//! Peer identity plus known addresses, the unit exchanged during discovery

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::address::{Address, P2pAddr};
use crate::types::PeerId;

/// A peer identifier with zero or more known addresses
///
/// An empty address list means the identity is known but its location is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub peer_id: PeerId,

    /// Known addresses, most preferred first, without duplicates
    pub addresses: Vec<Address>,
}

impl PeerInfo {
    /// Create peer info with no known addresses
    pub fn new(peer_id: PeerId) -> Self {
        PeerInfo {
            peer_id,
            addresses: Vec::new(),
        }
    }

    /// Create with addresses (duplicates are dropped)
    pub fn with_addresses(peer_id: PeerId, addresses: Vec<Address>) -> Self {
        let mut info = Self::new(peer_id);
        info.merge_addresses(addresses);
        info
    }

    /// Add addresses that are not already known, keeping existing order
    ///
    /// Returns true if any address was added.
    pub fn merge_addresses(&mut self, addresses: impl IntoIterator<Item = Address>) -> bool {
        let mut changed = false;
        for address in addresses {
            if !self.addresses.contains(&address) {
                self.addresses.push(address);
                changed = true;
            }
        }
        changed
    }

    /// Replace wildcard TCP addresses with the IP the peer was seen from
    ///
    /// Ports are kept. Wildcards of the other IP version, or any wildcard
    /// when `observed` is itself unspecified, are dropped. Returns true if
    /// the address list changed.
    pub fn resolve_unspecified(&mut self, observed: IpAddr) -> bool {
        if !self.addresses.iter().any(Address::is_unspecified) {
            return false;
        }

        let resolved: Vec<Address> = self
            .addresses
            .drain(..)
            .filter_map(|address| match address.socket_addr() {
                Some(addr) if addr.ip().is_unspecified() => {
                    let usable = !observed.is_unspecified()
                        && observed.is_ipv4() == addr.ip().is_ipv4();
                    usable.then(|| Address::Tcp(SocketAddr::new(observed, addr.port())))
                }
                _ => Some(address),
            })
            .collect();
        self.merge_addresses(resolved);
        true
    }

    /// Addresses in `/.../p2p/<peer-id>` form
    pub fn p2p_addrs(&self) -> Vec<P2pAddr> {
        self.addresses
            .iter()
            .cloned()
            .map(|address| address.with_peer(self.peer_id))
            .collect()
    }
}

impl From<P2pAddr> for PeerInfo {
    fn from(addr: P2pAddr) -> Self {
        PeerInfo::with_addresses(addr.peer_id, vec![addr.address])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_addresses_dedups() {
        let info = PeerInfo::with_addresses(
            PeerId::from_bytes([1; 32]),
            vec![Address::Memory(1), Address::Memory(1), Address::Memory(2)],
        );
        assert_eq!(info.addresses, vec![Address::Memory(1), Address::Memory(2)]);
    }

    #[test]
    fn test_merge_reports_change() {
        let mut info = PeerInfo::new(PeerId::from_bytes([1; 32]));
        assert!(info.merge_addresses(vec![Address::Memory(5)]));
        assert!(!info.merge_addresses(vec![Address::Memory(5)]));
        assert_eq!(info.addresses.len(), 1);
    }

    #[test]
    fn test_p2p_addrs() {
        let peer_id = PeerId::from_bytes([2; 32]);
        let info = PeerInfo::with_addresses(peer_id, vec![Address::Memory(9)]);
        let addrs = info.p2p_addrs();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].peer_id, peer_id);
        assert_eq!(PeerInfo::from(addrs[0].clone()), info);
    }

    #[test]
    fn test_resolve_unspecified() {
        let peer_id = PeerId::random();
        let mut info = PeerInfo::with_addresses(
            peer_id,
            vec![
                "/ip4/0.0.0.0/tcp/4001".parse().unwrap(),
                "/ip6/::/tcp/4002".parse().unwrap(),
                "/ip4/10.0.0.7/tcp/4001".parse().unwrap(),
                Address::Memory(3),
            ],
        );

        assert!(info.resolve_unspecified("10.0.0.7".parse().unwrap()));
        let expected: Vec<Address> = vec![
            "/ip4/10.0.0.7/tcp/4001".parse().unwrap(),
            Address::Memory(3),
        ];
        assert_eq!(info.addresses, expected);
        assert!(!info.addresses.iter().any(Address::is_unspecified));
        assert!(!info.resolve_unspecified("10.0.0.8".parse().unwrap()));
    }
}
