//! Kademlia routing table

use crate::address_book::AddressBook;
use crate::entry::PeerEntry;
use crate::kbucket::KBucket;
use crate::K;
use peerlink_protocol::{Distance, PeerId, PeerInfo, PEER_ID_BITS, PEER_ID_SIZE};
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Reverse;
use std::time::Duration;

/// Routing table parameters
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Entries per bucket (K)
    pub bucket_size: usize,

    /// Consecutive failures after which an entry counts as dead
    pub max_failures: u32,

    /// Time without contact after which an entry counts as dead
    pub peer_expiry: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            bucket_size: K,
            max_failures: 5,
            peer_expiry: Duration::from_secs(3600),
        }
    }
}

/// What an insert did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry appended to a bucket with room
    Inserted,

    /// Known entry refreshed and moved to most-recently-seen
    Updated,

    /// Least-recently-seen entry was dead and got replaced
    Evicted(PeerId),

    /// Bucket full and its oldest entry alive; table unchanged
    Rejected,

    /// The local peer is never stored
    SelfEntry,
}

impl InsertOutcome {
    /// Whether the table state changed
    pub fn changed(&self) -> bool {
        matches!(
            self,
            InsertOutcome::Inserted | InsertOutcome::Updated | InsertOutcome::Evicted(_)
        )
    }
}

/// Kademlia routing table
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Our local peer ID
    local_peer_id: PeerId,

    config: TableConfig,

    /// One k-bucket per bit of distance, closest range first
    buckets: Vec<KBucket>,

    /// Addresses of every peer in the buckets
    address_book: AddressBook,

    /// Total peers in routing table
    node_count: usize,
}

impl RoutingTable {
    /// Create a new routing table with default parameters
    pub fn new(local_peer_id: PeerId) -> Self {
        Self::with_config(local_peer_id, TableConfig::default())
    }

    /// Create a routing table with `bucket_size` entries per bucket
    pub fn with_bucket_size(local_peer_id: PeerId, bucket_size: usize) -> Self {
        Self::with_config(
            local_peer_id,
            TableConfig {
                bucket_size,
                ..Default::default()
            },
        )
    }

    pub fn with_config(local_peer_id: PeerId, config: TableConfig) -> Self {
        let buckets = (0..PEER_ID_BITS)
            .map(|i| KBucket::new(i, config.bucket_size))
            .collect();

        RoutingTable {
            local_peer_id,
            config,
            buckets,
            address_book: AddressBook::new(),
            node_count: 0,
        }
    }

    /// Get our local peer ID
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Get total number of peers in routing table
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Bucket a peer belongs in; `None` for the local ID
    pub fn bucket_index(&self, peer_id: &PeerId) -> Option<usize> {
        self.local_peer_id.distance(peer_id).bucket_index()
    }

    /// Insert or refresh a peer using the passive liveness check
    ///
    /// On a full bucket the least-recently-seen entry is evicted only if it
    /// failed too often or expired. Returns whether the table changed.
    pub fn insert(&mut self, peer: PeerInfo) -> bool {
        let max_failures = self.config.max_failures;
        let peer_expiry = self.config.peer_expiry;
        self.insert_with(peer, |oldest| oldest.should_evict(max_failures, peer_expiry))
            .changed()
    }

    /// Insert or refresh a peer, deciding eviction with `is_dead`
    ///
    /// `is_dead` is only called when the target bucket is full, with the
    /// bucket's least-recently-seen entry.
    pub fn insert_with<F>(&mut self, peer: PeerInfo, is_dead: F) -> InsertOutcome
    where
        F: FnOnce(&PeerEntry) -> bool,
    {
        let Some(index) = self.bucket_index(&peer.peer_id) else {
            return InsertOutcome::SelfEntry;
        };
        let bucket = &mut self.buckets[index];

        if bucket.touch(&peer.peer_id) {
            self.address_book.insert(&peer);
            return InsertOutcome::Updated;
        }

        if bucket.push(PeerEntry::new(peer.peer_id)) {
            self.address_book.insert(&peer);
            self.node_count += 1;
            return InsertOutcome::Inserted;
        }

        let dead = match bucket.oldest() {
            Some(oldest) => is_dead(oldest),
            None => false,
        };
        if !dead {
            return InsertOutcome::Rejected;
        }

        match bucket.replace_oldest(PeerEntry::new(peer.peer_id)) {
            Some(evicted) => {
                self.address_book.remove(&evicted.peer_id);
                self.address_book.insert(&peer);
                InsertOutcome::Evicted(evicted.peer_id)
            }
            None => {
                self.address_book.insert(&peer);
                self.node_count += 1;
                InsertOutcome::Inserted
            }
        }
    }

    /// Entry that would have to go for `peer_id` to be inserted
    ///
    /// `None` if the peer is already present, is us, or its bucket has room.
    pub fn eviction_candidate(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        let index = self.bucket_index(peer_id)?;
        let bucket = &self.buckets[index];
        if !bucket.is_full() || bucket.find(peer_id).is_some() {
            return None;
        }
        bucket.oldest().map(|entry| self.peer_info(&entry.peer_id))
    }

    /// Remove a peer from the routing table; no-op if absent
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        let index = self.bucket_index(peer_id)?;
        let entry = self.buckets[index].remove(peer_id)?;
        self.node_count -= 1;
        let addresses = self.address_book.remove(&entry.peer_id).unwrap_or_default();
        Some(PeerInfo::with_addresses(entry.peer_id, addresses))
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entry(peer_id).is_some()
    }

    /// Bookkeeping entry for a peer
    pub fn entry(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        let index = self.bucket_index(peer_id)?;
        self.buckets[index].find(peer_id)
    }

    /// Peer info for a peer in the table
    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.entry(peer_id).map(|entry| self.peer_info(&entry.peer_id))
    }

    fn peer_info(&self, peer_id: &PeerId) -> PeerInfo {
        self.address_book
            .peer_info(peer_id)
            .unwrap_or_else(|| PeerInfo::new(*peer_id))
    }

    /// Up to `count` peers ordered by XOR distance to `target`
    ///
    /// Ties are broken most-recently-seen first.
    pub fn closest_peers(&self, target: &PeerId, count: usize) -> Vec<PeerInfo> {
        let mut entries: Vec<&PeerEntry> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.entries().iter())
            .collect();

        entries.sort_by_key(|entry| (target.distance(&entry.peer_id), Reverse(entry.last_seen)));

        entries
            .into_iter()
            .take(count)
            .map(|entry| self.peer_info(&entry.peer_id))
            .collect()
    }

    /// Record a successful query; moves the peer to most-recently-seen
    pub fn record_success(&mut self, peer_id: &PeerId, rtt: Duration) -> bool {
        let Some(index) = self.bucket_index(peer_id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        if !bucket.touch(peer_id) {
            return false;
        }
        if let Some(entry) = bucket.find_mut(peer_id) {
            entry.record_success(rtt);
        }
        true
    }

    /// Record a failed query; the peer keeps its position
    pub fn record_failure(&mut self, peer_id: &PeerId) -> bool {
        let Some(index) = self.bucket_index(peer_id) else {
            return false;
        };
        match self.buckets[index].find_mut(peer_id) {
            Some(entry) => {
                entry.record_failure();
                true
            }
            None => false,
        }
    }

    /// Remove peers not seen for `max_age` from all buckets
    pub fn prune_stale(&mut self, max_age: Duration) -> Vec<PeerId> {
        let mut pruned = Vec::new();

        for bucket in &mut self.buckets {
            pruned.extend(bucket.prune_stale(max_age));
        }
        for peer_id in &pruned {
            self.address_book.remove(peer_id);
        }
        self.node_count -= pruned.len();

        pruned
    }

    /// Non-empty buckets not updated within `max_age`
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .filter(|bucket| !bucket.is_empty() && bucket.last_updated.elapsed() > max_age)
            .map(|bucket| bucket.index)
            .collect()
    }

    /// Mark a bucket as refreshed
    pub fn mark_refreshed(&mut self, index: usize) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.mark_updated();
        }
    }

    /// Random ID whose distance from us falls in bucket `index`
    pub fn random_id_in_bucket<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> PeerId {
        let index = index.min(PEER_ID_BITS - 1);
        let mut bytes = [0u8; PEER_ID_SIZE];
        rng.fill_bytes(&mut bytes);

        let top = PEER_ID_SIZE - 1 - index / 8;
        let bit = index % 8;
        for byte in bytes[..top].iter_mut() {
            *byte = 0;
        }
        let low_mask = ((1u16 << bit) - 1) as u8;
        bytes[top] = (bytes[top] & low_mask) | (1u8 << bit);

        self.local_peer_id.xor(&Distance::from_bytes(bytes))
    }

    /// All peers in the table, closest bucket first
    pub fn all_peers(&self) -> Vec<PeerInfo> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.entries().iter())
            .map(|entry| self.peer_info(&entry.peer_id))
            .collect()
    }

    /// Get bucket by index
    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }

    /// Snapshot of buckets `0..=highest non-empty`, each padded up to K
    ///
    /// An under-filled bucket first takes every entry of the closer buckets.
    /// When those do not all fit it takes the ones closest to us instead.
    /// Otherwise farther buckets are appended whole while they fit, and a
    /// random subset of the next farther bucket fills what remains.
    pub fn normalized_buckets<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Vec<PeerInfo>> {
        let Some(highest) = self.buckets.iter().rposition(|b| !b.is_empty()) else {
            return Vec::new();
        };
        let k = self.config.bucket_size;

        let ids: Vec<Vec<PeerId>> = self.buckets[..=highest]
            .iter()
            .map(|bucket| bucket.entries().iter().map(|e| e.peer_id).collect())
            .collect();

        let mut normalized = Vec::with_capacity(ids.len());
        for index in 0..ids.len() {
            let mut padded = ids[index].clone();

            if padded.len() < k {
                let room = k - padded.len();
                let mut closer: Vec<PeerId> = ids[..index].iter().flatten().copied().collect();

                if closer.len() <= room {
                    padded.extend(closer);

                    let mut next = index + 1;
                    while next < ids.len() && padded.len() + ids[next].len() <= k {
                        padded.extend(ids[next].iter().copied());
                        next += 1;
                    }
                    if next < ids.len() && padded.len() < k {
                        let wanted = k - padded.len();
                        padded.extend(ids[next].choose_multiple(rng, wanted).copied());
                    }
                } else {
                    closer.sort_by_key(|id| self.local_peer_id.distance(id));
                    padded.extend(closer.into_iter().take(room));
                }
            }

            normalized.push(padded.iter().map(|id| self.peer_info(id)).collect());
        }

        normalized
    }
}
