//! Peer address book
//!
//! Maps peer ids to the addresses they were last reachable at. The routing
//! table owns one; buckets only hold ids and liveness bookkeeping.

use peerlink_protocol::{Address, PeerId, PeerInfo};
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct AddressRecord {
    addresses: Vec<Address>,
    updated_at: Instant,
}

/// Mapping from peer id to known addresses
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    records: HashMap<PeerId, AddressRecord>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the addresses of a peer, merging with what is already known
    ///
    /// Returns true if anything new was learned.
    pub fn insert(&mut self, peer: &PeerInfo) -> bool {
        let now = Instant::now();
        match self.records.get_mut(&peer.peer_id) {
            Some(record) => {
                record.updated_at = now;
                let mut changed = false;
                for address in &peer.addresses {
                    if !record.addresses.contains(address) {
                        record.addresses.push(address.clone());
                        changed = true;
                    }
                }
                changed
            }
            None => {
                let mut addresses = Vec::with_capacity(peer.addresses.len());
                for address in &peer.addresses {
                    if !addresses.contains(address) {
                        addresses.push(address.clone());
                    }
                }
                self.records.insert(
                    peer.peer_id,
                    AddressRecord {
                        addresses,
                        updated_at: now,
                    },
                );
                true
            }
        }
    }

    /// Known addresses for a peer
    pub fn addresses(&self, peer_id: &PeerId) -> Option<&[Address]> {
        self.records.get(peer_id).map(|r| r.addresses.as_slice())
    }

    /// Peer info assembled from the stored addresses
    pub fn peer_info(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.records
            .get(peer_id)
            .map(|r| PeerInfo::with_addresses(*peer_id, r.addresses.clone()))
    }

    /// When the addresses of a peer were last confirmed
    pub fn updated_at(&self, peer_id: &PeerId) -> Option<Instant> {
        self.records.get(peer_id).map(|r| r.updated_at)
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Vec<Address>> {
        self.records.remove(peer_id).map(|r| r.addresses)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.records.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
